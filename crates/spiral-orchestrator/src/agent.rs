//! The agent capability interface and its mailbox driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spiral_bus::{Mailbox, Message, MessageKind, Recipient};
use spiral_core::{AgentId, Context, OptionId, Result, SpiralError};
use tracing::{debug, warn};

use crate::consensus::{VoteCall, VoteCast};
use crate::delegation::DelegationHandOff;
use crate::orchestrator::Orchestrator;
use crate::registry::CapabilityDeclaration;

/// What an agent does with a delegated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationDecision {
    /// Keep the context and work on it.
    Accept,
    /// Hand it on to another agent.
    Forward(AgentId),
}

/// A participant in coordination.
///
/// Every entry point has a default, so an agent only implements the ones its
/// declared capabilities need.
#[async_trait]
pub trait Agent: Send + Sync {
    /// What the agent registers with.
    fn declaration(&self) -> CapabilityDeclaration;

    /// Contexts whose topics the agent subscribes to.
    fn interests(&self) -> Vec<Context> {
        Vec::new()
    }

    /// Answer a REQUEST. The returned map becomes the RESPONSE payload.
    async fn handle_request(
        &self,
        _request: &Message,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        Ok(serde_json::Map::new())
    }

    /// Cast a ballot when a vote is called, or abstain.
    async fn vote(&self, _call: &VoteCall, _context: &Context) -> Option<OptionId> {
        None
    }

    /// Decide what to do with a delegated context.
    async fn on_delegation(&self, _hand_off: &DelegationHandOff) -> DelegationDecision {
        DelegationDecision::Accept
    }

    /// Observe a NOTIFY or an unsolicited RESPONSE.
    async fn observe(&self, _message: &Message) {}
}

/// Drives one agent: dispatches its mailbox and keeps its heartbeat.
pub struct AgentRunner {
    agent: Arc<dyn Agent>,
    agent_id: AgentId,
    mailbox: Mailbox,
    orchestrator: Arc<Orchestrator>,
    heartbeat_every: Duration,
}

impl AgentRunner {
    pub fn new(
        agent: Arc<dyn Agent>,
        mailbox: Mailbox,
        orchestrator: Arc<Orchestrator>,
        heartbeat_every: Duration,
    ) -> Self {
        Self {
            agent_id: mailbox.endpoint.clone(),
            agent,
            mailbox,
            orchestrator,
            heartbeat_every,
        }
    }

    /// Run until the agent is deregistered or evicted.
    pub async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_every);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.orchestrator.heartbeat(&self.agent_id).await {
                        warn!("Agent '{}' stopped heartbeating: {}", self.agent_id, e);
                        break;
                    }
                }
            }
        }

        debug!("Agent runner for '{}' exited", self.agent_id);
    }

    async fn dispatch(&self, msg: Message) {
        let outcome = match msg.kind {
            MessageKind::Request => self.answer(&msg).await,
            MessageKind::Vote => self.ballot(&msg).await,
            MessageKind::Delegate => self.hand_off(&msg).await,
            MessageKind::Notify | MessageKind::Response => {
                self.agent.observe(&msg).await;
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(
                "Agent '{}' failed to handle {:?} {}: {}",
                self.agent_id, msg.kind, msg.id, e
            );
        }
    }

    async fn answer(&self, request: &Message) -> Result<()> {
        let payload = match self.agent.handle_request(request).await {
            Ok(payload) => payload,
            Err(e) => {
                let mut payload = serde_json::Map::new();
                payload.insert("error".to_string(), e.code().into());
                payload.insert("message".to_string(), e.to_string().into());
                payload
            }
        };

        let mut response = Message::response_to(request, self.agent_id.clone());
        response.payload = payload;
        self.orchestrator.bus().send(response).await?;
        Ok(())
    }

    async fn ballot(&self, msg: &Message) -> Result<()> {
        // Only calls for ballots are acted on; other agents' ballots are ignored.
        if msg.sender != self.orchestrator.endpoint() {
            return Ok(());
        }
        let Recipient::Topic(topic) = &msg.recipient else {
            return Ok(());
        };

        let call: VoteCall = msg.body()?;
        let Some(option) = self.agent.vote(&call, &msg.context).await else {
            return Ok(());
        };

        let cast = Message::vote(self.agent_id.clone(), topic.clone(), msg.context.clone())
            .with_body(&VoteCast {
                primitive_id: call.primitive_id,
                option,
            })?;
        self.orchestrator.bus().send(cast).await?;
        Ok(())
    }

    async fn hand_off(&self, msg: &Message) -> Result<()> {
        let hand_off: DelegationHandOff = msg.body()?;
        match self.agent.on_delegation(&hand_off).await {
            DelegationDecision::Accept => {
                debug!("Agent '{}' accepted context {}", self.agent_id, hand_off.context_id);
                Ok(())
            }
            DelegationDecision::Forward(target) => {
                match self
                    .orchestrator
                    .delegate(hand_off.context_id, &self.agent_id, &target)
                    .await
                {
                    // The orchestrator already returned the context to its originator.
                    Err(SpiralError::DelegationCycle { .. }) => Ok(()),
                    other => other.map(|_| ()),
                }
            }
        }
    }
}
