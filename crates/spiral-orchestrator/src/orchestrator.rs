//! The orchestrator context.
//!
//! Created once per process and handed to every component. Owns the router,
//! bus, registry and delegation ledger around a shared kernel, and is torn
//! down with [`Orchestrator::shutdown`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use spiral_bus::{BusConfig, Mailbox, Message, MessageBus, MessageKind, Topic};
use spiral_core::{
    AgentId, ChoicePrimitive, Context, OptionId, PrimitiveId, ProducerResult, Resolution,
    Result, SelectionOutcome, SpiralError, TreeId, UndoOutcome,
};
use spiral_kernel::SpiralKernel;
use spiral_router::{ChoiceRouter, Expired, Intent, PendingRoute, Proposal, RouterConfig};
use tokio::sync::{broadcast, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentRunner};
use crate::consensus::{TallyResult, VoteCast, VotingRound};
use crate::delegation::{DelegationHandOff, DelegationLedger, DelegationRecord};
use crate::registry::{
    AgentRecord, AgentRegistry, AgentState, CapabilityDeclaration, RegistryConfig, SweepReport,
};

/// Configuration for the orchestrator and the components it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Bus name the orchestrator sends vote calls and notifications as.
    pub endpoint: String,

    /// How long a voting round collects ballots (milliseconds).
    pub voting_window_ms: u64,

    /// How often agent runners heartbeat (milliseconds).
    pub heartbeat_interval_ms: u64,

    pub router: RouterConfig,

    pub bus: BusConfig,

    pub registry: RegistryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "orchestrator".to_string(),
            voting_window_ms: 1_000,
            heartbeat_interval_ms: 10_000,
            router: RouterConfig::default(),
            bus: BusConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Result of proposing an option.
#[derive(Debug, Clone)]
pub enum ProposalOutcome {
    /// The proposal won the compare-and-set.
    Selected(SelectionOutcome),
    /// A round is open; the proposal joined it.
    Voting { closes_at: DateTime<Utc> },
    /// Another selection already stands.
    Contested { standing: OptionId },
}

/// Result of a voting round.
#[derive(Debug, Clone)]
pub enum VoteOutcome {
    /// The winner was selected.
    Selected {
        tally: TallyResult,
        selection: SelectionOutcome,
    },
    /// No ballot counted; the primitive stays pending.
    NoVotes { tally: TallyResult },
    /// The primitive was resolved before the round could select.
    Superseded { standing: OptionId },
    /// The round was cancelled by shutdown or expiry.
    Cancelled,
}

/// What one maintenance tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub expired: Vec<Expired>,
    pub sweep: SweepReport,
    pub expired_requests: Vec<Uuid>,
}

#[derive(Clone)]
struct OpenRound {
    round: Arc<Mutex<VotingRound>>,
    cancel: Arc<Notify>,
}

/// Serializes selection and round bookkeeping for one primitive.
struct Gate {
    lock: Arc<Mutex<()>>,
    users: usize,
    round: Option<OpenRound>,
}

type Gates = StdMutex<HashMap<PrimitiveId, Gate>>;

fn lock_gates(gates: &Gates) -> std::sync::MutexGuard<'_, HashMap<PrimitiveId, Gate>> {
    gates.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds one primitive's gate; the entry goes away with its last user.
struct GateGuard<'a> {
    gates: &'a Gates,
    primitive_id: PrimitiveId,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut gates = lock_gates(self.gates);
        if let Some(gate) = gates.get_mut(&self.primitive_id) {
            gate.users = gate.users.saturating_sub(1);
            if gate.users == 0 && gate.round.is_none() {
                gates.remove(&self.primitive_id);
            }
        }
    }
}

/// Coordinates agents around the kernel.
pub struct Orchestrator {
    config: OrchestratorConfig,
    kernel: Arc<SpiralKernel>,
    router: ChoiceRouter,
    bus: MessageBus,
    registry: AgentRegistry,
    ledger: DelegationLedger,
    gates: Gates,
    closed: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator with a fresh kernel.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_kernel(Arc::new(SpiralKernel::new()), config)
    }

    /// Create an orchestrator around an existing kernel.
    pub fn with_kernel(kernel: Arc<SpiralKernel>, config: OrchestratorConfig) -> Self {
        Self {
            router: ChoiceRouter::new(kernel.clone(), config.router.clone()),
            bus: MessageBus::new(config.bus.clone()),
            registry: AgentRegistry::new(config.registry.clone()),
            ledger: DelegationLedger::new(),
            gates: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            kernel,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn kernel(&self) -> &Arc<SpiralKernel> {
        &self.kernel
    }

    pub fn router(&self) -> &ChoiceRouter {
        &self.router
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &DelegationLedger {
        &self.ledger
    }

    /// Check if shutdown has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SpiralError::Internal("orchestrator is shut down".to_string()));
        }
        Ok(())
    }

    /// Register an agent and open its mailbox.
    pub async fn register_agent(&self, declaration: CapabilityDeclaration) -> Result<Mailbox> {
        self.ensure_open()?;
        let record = self.registry.register(declaration).await?;

        match self.bus.register(record.agent_id.clone()).await {
            Ok(mailbox) => Ok(mailbox),
            Err(e) => {
                let _ = self.registry.deregister(&record.agent_id).await;
                Err(e)
            }
        }
    }

    /// Register an agent, subscribe it to its interests and run it.
    pub async fn spawn_agent(self: &Arc<Self>, agent: Arc<dyn Agent>) -> Result<JoinHandle<()>> {
        let mailbox = self.register_agent(agent.declaration()).await?;
        for context in agent.interests() {
            self.subscribe(&mailbox.endpoint, &context).await?;
        }

        let runner = AgentRunner::new(
            agent,
            mailbox,
            self.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms.max(1)),
        );
        Ok(tokio::spawn(runner.run()))
    }

    /// Subscribe an agent to the topic of a context.
    pub async fn subscribe(&self, agent_id: &str, context: &Context) -> Result<Topic> {
        let topic = Topic::of(context);
        self.bus.subscribe(agent_id, topic.clone()).await?;
        Ok(topic)
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<AgentState> {
        self.registry.heartbeat(agent_id, Utc::now()).await
    }

    /// Deregister an agent, closing its mailbox and dropping its delegation chains.
    pub async fn deregister(&self, agent_id: &str) -> Result<AgentRecord> {
        let record = self.registry.deregister(agent_id).await?;
        self.bus.unregister(agent_id).await;
        let dropped = self.ledger.forget_agent(agent_id).await;
        if !dropped.is_empty() {
            debug!("Dropped {} delegation chains of '{}'", dropped.len(), agent_id);
        }
        Ok(record)
    }

    /// Agents able to handle a capability, highest weight first.
    pub async fn capable_agents(&self, capability: &str) -> Vec<AgentRecord> {
        self.registry.with_capability(capability).await
    }

    /// Handle an intent end to end for a result producer.
    pub async fn submit(&self, intent: Intent) -> ProducerResult {
        if let Err(e) = self.ensure_open() {
            return ProducerResult::failed(&e, Vec::new());
        }

        let routed = match self.router.route(intent).await {
            Ok(routed) => routed,
            Err(e) => return ProducerResult::failed(&e, Vec::new()),
        };
        let pid = routed.primitive_id;

        if routed.is_contested() {
            let outcome = match self.run_vote(pid, None).await {
                Err(SpiralError::RoundInProgress { .. }) => match routed.proposals.last() {
                    Some(latest) => {
                        let joined = self.try_select(pid, latest.clone()).await;
                        return self.report_proposal(routed.tree_id, pid, joined).await;
                    }
                    None => Err(SpiralError::RoundInProgress { primitive_id: pid }),
                },
                other => other,
            };
            return self.report_vote(routed.tree_id, pid, outcome).await;
        }

        match routed.proposals.last() {
            Some(latest) => {
                let outcome = self.try_select(pid, latest.clone()).await;
                self.report_proposal(routed.tree_id, pid, outcome).await
            }
            None => ProducerResult::ok(
                json!({ "primitive_id": pid, "status": "pending", "attached": routed.attached }),
                vec![pid],
            ),
        }
    }

    /// Propose an option for a primitive.
    ///
    /// The first uncontested proposal wins by compare-and-set. While a round
    /// is open the proposal joins it instead. A later proposal for a different
    /// option reports the standing selection.
    pub async fn propose(
        &self,
        primitive_id: PrimitiveId,
        agent_id: &str,
        option: &str,
    ) -> Result<ProposalOutcome> {
        self.ensure_open()?;

        let recorded = match self
            .router
            .propose(primitive_id, agent_id.to_string(), option.to_string())
            .await
        {
            Ok(mut proposals) => proposals.pop(),
            // Not routed: only the kernel knows it.
            Err(SpiralError::UnknownPrimitive { .. }) => None,
            Err(e) => return Err(e),
        };

        let proposal = recorded.unwrap_or_else(|| Proposal {
            agent_id: agent_id.to_string(),
            option: option.to_string(),
            intent_id: Uuid::new_v4(),
            proposed_at: Utc::now(),
        });
        self.try_select(primitive_id, proposal).await
    }

    /// Wait for exclusive use of one primitive. Other primitives are unaffected.
    async fn enter(&self, primitive_id: PrimitiveId) -> GateGuard<'_> {
        let lock = {
            let mut gates = lock_gates(&self.gates);
            let gate = gates.entry(primitive_id).or_insert_with(|| Gate {
                lock: Arc::new(Mutex::new(())),
                users: 0,
                round: None,
            });
            gate.users += 1;
            gate.lock.clone()
        };

        let mut guard = GateGuard {
            gates: &self.gates,
            primitive_id,
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }

    fn open_round(&self, primitive_id: PrimitiveId) -> Option<OpenRound> {
        lock_gates(&self.gates)
            .get(&primitive_id)
            .and_then(|gate| gate.round.clone())
    }

    fn set_round(&self, primitive_id: PrimitiveId, round: Option<OpenRound>) {
        if let Some(gate) = lock_gates(&self.gates).get_mut(&primitive_id) {
            gate.round = round;
        }
    }

    /// Number of primitives with an open voting round.
    pub fn open_rounds(&self) -> usize {
        lock_gates(&self.gates)
            .values()
            .filter(|gate| gate.round.is_some())
            .count()
    }

    async fn try_select(&self, primitive_id: PrimitiveId, proposal: Proposal) -> Result<ProposalOutcome> {
        let gate = self.enter(primitive_id).await;
        if let Some(open) = self.open_round(primitive_id) {
            let mut round = open.round.lock().await;
            round.add_proposal(proposal);
            return Ok(ProposalOutcome::Voting {
                closes_at: round.closes_at,
            });
        }

        match self.kernel.select(primitive_id, &proposal.option).await {
            Ok(selection) => {
                drop(gate);
                self.settle(&selection).await;
                Ok(ProposalOutcome::Selected(selection))
            }
            Err(SpiralError::AlreadyResolved { selected, .. }) => {
                debug!(
                    "Proposal '{}' by '{}' lost to '{}' on {}",
                    proposal.option, proposal.agent_id, selected, primitive_id
                );
                Ok(ProposalOutcome::Contested { standing: selected })
            }
            Err(e) => Err(e),
        }
    }

    /// Run a voting round on a primitive and select the winner.
    ///
    /// Ballots come from ACTIVE agents subscribed to the topic of the
    /// primitive's declared matching subset. The round closes when every
    /// eligible agent has voted or the window ends, whichever comes first.
    pub async fn run_vote(&self, primitive_id: PrimitiveId, window: Option<Duration>) -> Result<VoteOutcome> {
        self.ensure_open()?;
        let window = window.unwrap_or(Duration::from_millis(self.config.voting_window_ms));

        let (round, cancel, mut tap, call) = {
            let _gate = self.enter(primitive_id).await;
            if self.open_round(primitive_id).is_some() {
                return Err(SpiralError::RoundInProgress { primitive_id });
            }

            let primitive = self.kernel.get(primitive_id).await?;
            if let Some(standing) = primitive.selected() {
                return Ok(VoteOutcome::Superseded {
                    standing: standing.to_string(),
                });
            }

            let route = self.router.pending(primitive_id).await;
            let topic = match route.as_ref() {
                Some(route) => topic_for(&route.scope, &primitive),
                None => topic_for(
                    &self.router.scope_of(primitive_id).await.unwrap_or_default(),
                    &primitive,
                ),
            };
            let subscribers = self.bus.subscribers(&topic).await;
            let eligible: BTreeMap<AgentId, f64> = self
                .registry
                .active_agents()
                .await
                .into_iter()
                .filter(|r| subscribers.contains(&r.agent_id))
                .map(|r| (r.agent_id, r.priority_weight))
                .collect();
            let proposals = route.map(|r| r.proposals).unwrap_or_default();

            let round = VotingRound::open(
                primitive,
                topic,
                eligible,
                proposals,
                chrono::Duration::milliseconds(window.as_millis() as i64),
            );
            let call = Message::vote(
                self.config.endpoint.clone(),
                round.topic.clone(),
                round.primitive.context.clone(),
            )
            .with_body(&round.call())?;
            let tap = self.bus.tap(round.topic.clone()).await;

            info!(
                "Opened vote on {} ({} eligible, {} proposals)",
                primitive_id,
                round.eligible.len(),
                round.proposals.len()
            );

            let round = Arc::new(Mutex::new(round));
            let cancel = Arc::new(Notify::new());
            self.set_round(
                primitive_id,
                Some(OpenRound {
                    round: round.clone(),
                    cancel: cancel.clone(),
                }),
            );
            (round, cancel, tap, call)
        };

        if let Err(e) = self.bus.send(call).await {
            warn!("Failed to announce vote on {}: {}", primitive_id, e);
        }

        let cancelled = self
            .collect_ballots(primitive_id, &round, &cancel, &mut tap, window)
            .await;
        drop(tap);
        let topic = round.lock().await.topic.clone();
        self.bus.untap(&topic).await;

        self.close_round(primitive_id, &round, cancelled).await
    }

    async fn collect_ballots(
        &self,
        primitive_id: PrimitiveId,
        round: &Mutex<VotingRound>,
        cancel: &Notify,
        tap: &mut broadcast::Receiver<Message>,
        window: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + window;

        loop {
            if round.lock().await.is_complete() {
                return false;
            }

            tokio::select! {
                _ = cancel.notified() => return true,
                _ = tokio::time::sleep_until(deadline) => return false,
                received = tap.recv() => match received {
                    Ok(msg) => self.accept_ballot(primitive_id, round, msg).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Vote on {} missed {} messages", primitive_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                },
            }
        }
    }

    async fn accept_ballot(&self, primitive_id: PrimitiveId, round: &Mutex<VotingRound>, msg: Message) {
        if msg.kind != MessageKind::Vote || msg.sender == self.config.endpoint {
            return;
        }
        let Ok(cast) = msg.body::<VoteCast>() else {
            return;
        };
        if cast.primitive_id != primitive_id {
            return;
        }

        if round.lock().await.cast(&msg.sender, &cast.option, Utc::now()) {
            debug!("Ballot from '{}' for '{}' on {}", msg.sender, cast.option, primitive_id);
        } else {
            debug!("Ignored ballot from '{}' on {}", msg.sender, primitive_id);
        }
    }

    async fn close_round(
        &self,
        primitive_id: PrimitiveId,
        round: &Mutex<VotingRound>,
        cancelled: bool,
    ) -> Result<VoteOutcome> {
        let gate = self.enter(primitive_id).await;
        self.set_round(primitive_id, None);

        if cancelled {
            warn!("Vote on {} cancelled", primitive_id);
            return Ok(VoteOutcome::Cancelled);
        }

        let tally = round.lock().await.tally();
        let Some(winner) = tally.winner.clone() else {
            info!("Vote on {} closed without ballots", primitive_id);
            return Ok(VoteOutcome::NoVotes { tally });
        };

        match self.kernel.select(primitive_id, &winner).await {
            Ok(selection) => {
                drop(gate);
                info!(
                    "Vote on {} selected '{}' ({} ballots)",
                    primitive_id, winner, tally.ballots_counted
                );
                self.settle(&selection).await;
                Ok(VoteOutcome::Selected { tally, selection })
            }
            Err(SpiralError::AlreadyResolved { selected, .. }) => {
                Ok(VoteOutcome::Superseded { standing: selected })
            }
            Err(e) => Err(e),
        }
    }

    /// Release the route, track spawned children and announce the outcome.
    async fn settle(&self, selection: &SelectionOutcome) {
        if !selection.changed {
            return;
        }

        let resolution = Resolution::selected(
            selection.primitive_id,
            selection.option.clone(),
            selection.spawned.clone(),
        );
        let route = self.router.resolve(resolution.clone()).await;
        self.ledger.complete(selection.primitive_id).await;

        self.track_children(&resolution.spawned, route.as_ref()).await;
        self.announce(&resolution, route.as_ref()).await;
    }

    /// Children wait for the same requesters and share their parent's topic.
    async fn track_children(&self, children: &[PrimitiveId], parent: Option<&PendingRoute>) {
        let (requesters, scope) = parent
            .map(|r| (r.requesters.clone(), r.scope.clone()))
            .unwrap_or_default();
        for child in children {
            if let Err(e) = self.router.track(*child, requesters.clone(), scope.clone()).await {
                warn!("Could not track spawned primitive {}: {}", child, e);
            }
        }
    }

    /// Publish a resolution on the primitive's topic and notify requesters
    /// that do not listen there.
    async fn announce(&self, resolution: &Resolution, route: Option<&PendingRoute>) {
        let Ok(primitive) = self.kernel.get(resolution.primitive_id).await else {
            return;
        };

        let topic = topic_for(route.map(|r| &r.scope).unwrap_or(&Context::new()), &primitive);
        let listeners = self.bus.subscribers(&topic).await;
        let msg = Message::notify(self.config.endpoint.clone(), topic, primitive.context.clone())
            .with_body(resolution);
        match msg {
            Ok(msg) => {
                if let Err(e) = self.bus.send(msg).await {
                    warn!("Failed to announce {}: {}", resolution.primitive_id, e);
                }
            }
            Err(e) => warn!("Failed to encode resolution: {}", e),
        }

        let requesters = route.map(|r| r.requesters.as_slice()).unwrap_or_default();
        for requester in requesters {
            if listeners.contains(requester) {
                continue;
            }
            self.notify_requester(requester, resolution, &primitive.context)
                .await;
        }
    }

    async fn notify_requester(&self, requester: &str, resolution: &Resolution, context: &Context) {
        if !self.bus.is_registered(requester).await {
            return;
        }

        let msg = Message::notify_agent(
            self.config.endpoint.clone(),
            requester.to_string(),
            context.clone(),
        )
        .with_body(resolution);
        match msg {
            Ok(msg) => {
                if let Err(e) = self.bus.send(msg).await {
                    warn!(
                        "Failed to notify '{}' of {}: {}",
                        requester, resolution.primitive_id, e
                    );
                }
            }
            Err(e) => warn!("Failed to encode resolution: {}", e),
        }
    }

    async fn recovery_choices(&self, tree_id: TreeId) -> Vec<PrimitiveId> {
        self.kernel
            .pending(tree_id)
            .await
            .map(|pending| pending.into_iter().map(|p| p.id).collect())
            .unwrap_or_default()
    }

    async fn report_proposal(
        &self,
        tree_id: TreeId,
        primitive_id: PrimitiveId,
        outcome: Result<ProposalOutcome>,
    ) -> ProducerResult {
        match outcome {
            Ok(ProposalOutcome::Selected(selection)) => ProducerResult::ok(
                json!({
                    "primitive_id": primitive_id,
                    "status": "selected",
                    "selected": selection.option,
                }),
                selection.spawned,
            ),
            Ok(ProposalOutcome::Voting { closes_at }) => ProducerResult::ok(
                json!({
                    "primitive_id": primitive_id,
                    "status": "voting",
                    "closes_at": closes_at,
                }),
                vec![primitive_id],
            ),
            Ok(ProposalOutcome::Contested { standing }) => {
                self.report_standing(tree_id, primitive_id, standing).await
            }
            Err(e) => ProducerResult::failed(&e, self.recovery_choices(tree_id).await),
        }
    }

    async fn report_vote(
        &self,
        tree_id: TreeId,
        primitive_id: PrimitiveId,
        outcome: Result<VoteOutcome>,
    ) -> ProducerResult {
        match outcome {
            Ok(VoteOutcome::Selected { tally, selection }) => ProducerResult::ok(
                json!({
                    "primitive_id": primitive_id,
                    "status": "selected",
                    "selected": selection.option,
                    "ballots": tally.ballots_counted,
                }),
                selection.spawned,
            ),
            Ok(VoteOutcome::NoVotes { .. }) => ProducerResult::ok(
                json!({ "primitive_id": primitive_id, "status": "pending" }),
                vec![primitive_id],
            ),
            Ok(VoteOutcome::Superseded { standing }) => {
                self.report_standing(tree_id, primitive_id, standing).await
            }
            Ok(VoteOutcome::Cancelled) => ProducerResult::failed(
                &SpiralError::Internal(format!("vote on {} was cancelled", primitive_id)),
                Vec::new(),
            ),
            Err(e) => ProducerResult::failed(&e, self.recovery_choices(tree_id).await),
        }
    }

    async fn report_standing(
        &self,
        tree_id: TreeId,
        primitive_id: PrimitiveId,
        standing: OptionId,
    ) -> ProducerResult {
        let err = SpiralError::AlreadyResolved {
            primitive_id,
            selected: standing.clone(),
            requested: String::new(),
        };
        let mut result = ProducerResult::failed(&err, self.recovery_choices(tree_id).await);
        result.data = json!({
            "code": err.code(),
            "primitive_id": primitive_id,
            "selected": standing,
        });
        result
    }

    /// Undo the latest selection in a tree, keeping the router in step.
    ///
    /// Routes of removed descendants are cancelled and their requesters told.
    /// The reverted primitive is pending again with its original route.
    pub async fn undo(&self, tree_id: TreeId) -> Result<UndoOutcome> {
        let outcome = self.kernel.undo(tree_id).await?;

        for removed in &outcome.removed {
            if let Some(route) = self.router.forget(*removed).await {
                let cancelled = Resolution::cancelled(*removed);
                for requester in &route.requesters {
                    self.notify_requester(requester, &cancelled, &route.scope)
                        .await;
                }
            }
            self.ledger.complete(*removed).await;
        }
        let reopened = self.router.reopen(outcome.primitive_id).await?;
        debug!(
            "Reopened {} for {} requesters",
            outcome.primitive_id,
            reopened.requesters.len()
        );

        Ok(outcome)
    }

    /// Hand a choice context from one agent to another.
    ///
    /// On a cycle the context goes back, unresolved, to the agent that started
    /// the chain and the error is returned to the caller.
    pub async fn delegate(
        &self,
        context_id: PrimitiveId,
        from: &str,
        to: &str,
    ) -> Result<DelegationRecord> {
        self.ensure_open()?;
        let primitive = self.kernel.get(context_id).await?;
        if !self.bus.is_registered(to).await {
            return Err(SpiralError::UnknownAgent {
                agent_id: to.to_string(),
            });
        }

        match self.ledger.delegate(context_id, from, to).await {
            Ok(record) => {
                let msg = Message::delegate(from, to, primitive.context).with_body(
                    &DelegationHandOff {
                        context_id,
                        chain: record.chain.clone(),
                        returned: false,
                    },
                )?;
                self.bus.send(msg).await?;
                Ok(record)
            }
            Err(SpiralError::DelegationCycle {
                context_id,
                target,
                chain,
                returned_to,
            }) => {
                let back = Message::delegate(
                    self.config.endpoint.clone(),
                    returned_to.clone(),
                    primitive.context,
                )
                .with_body(&DelegationHandOff {
                    context_id,
                    chain: chain.clone(),
                    returned: true,
                })?;
                if let Err(e) = self.bus.send(back).await {
                    warn!("Could not return {} to '{}': {}", context_id, returned_to, e);
                }

                Err(SpiralError::DelegationCycle {
                    context_id,
                    target,
                    chain,
                    returned_to,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Expire due routes and requests and apply heartbeat deadlines.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let expired = self.router.expire_due(now).await;
        for e in &expired {
            let pid = e.resolution.primitive_id;
            if let Some(open) = self.open_round(pid) {
                open.cancel.notify_one();
            }
            self.ledger.complete(pid).await;
            self.track_children(&e.resolution.spawned, Some(&e.route))
                .await;
            self.announce(&e.resolution, Some(&e.route)).await;
        }

        let sweep = self.registry.sweep(now).await;
        for agent_id in &sweep.terminated {
            self.bus.unregister(agent_id).await;
            self.ledger.forget_agent(agent_id).await;
        }

        let expired_requests = self.bus.expire_requests(now).await;

        TickReport {
            expired,
            sweep,
            expired_requests,
        }
    }

    /// Tear down: cancel open votes, deregister every agent and cancel pending routes.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for gate in lock_gates(&self.gates).values() {
            if let Some(open) = gate.round.as_ref() {
                open.cancel.notify_one();
            }
        }

        let agents = self.registry.agents().await;
        for record in &agents {
            if let Err(e) = self.deregister(&record.agent_id).await {
                debug!("Deregistering '{}' during shutdown: {}", record.agent_id, e);
            }
        }

        let cancelled = self.router.cancel_all().await;
        info!(
            "Orchestrator shut down ({} agents deregistered, {} routes cancelled)",
            agents.len(),
            cancelled.len()
        );
    }
}

/// Topic for a primitive's votes and announcements: its declared matching
/// subset, or the full context when nothing was declared.
fn topic_for(scope: &Context, primitive: &ChoicePrimitive) -> Topic {
    if scope.is_empty() {
        Topic::of(&primitive.context)
    } else {
        Topic::of(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default())
    }

    fn storage_intent(requester: &str) -> spiral_router::IntentBuilder {
        Intent::builder()
            .requester(requester)
            .options(["A", "B", "C"])
            .match_on("domain", "storage")
    }

    #[tokio::test]
    async fn test_submit_without_proposal_is_pending() {
        let orch = orchestrator();
        let result = orch.submit(storage_intent("ui").build().unwrap()).await;

        assert!(result.success);
        assert_eq!(result.data["status"], "pending");
        assert_eq!(result.next_choices.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_uncontested_selects() {
        let orch = orchestrator();
        let result = orch
            .submit(storage_intent("ui").propose("B").build().unwrap())
            .await;

        assert!(result.success);
        assert_eq!(result.data["selected"], "B");
        assert!(orch.router().pending_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_intent_fails_without_recovery() {
        let orch = orchestrator();
        let intent = Intent::builder().requester("ui").match_on("domain", "x").build().unwrap();
        let result = orch.submit(intent).await;

        assert!(!result.success);
        assert_eq!(result.data["code"], "empty_option_set");
    }

    #[tokio::test]
    async fn test_late_proposal_reports_standing() {
        let orch = orchestrator();
        let pid = orch
            .kernel()
            .create(vec!["A".to_string(), "B".to_string()], Context::new())
            .await
            .unwrap();

        let first = orch.propose(pid, "x", "A").await.unwrap();
        assert!(matches!(first, ProposalOutcome::Selected(_)));

        match orch.propose(pid, "y", "B").await.unwrap() {
            ProposalOutcome::Contested { standing } => assert_eq!(standing, "A"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_vote_without_voters_keeps_pending() {
        let orch = orchestrator();
        let routed = orch
            .router()
            .route(storage_intent("ui").build().unwrap())
            .await
            .unwrap();

        let outcome = orch.run_vote(routed.primitive_id, None).await.unwrap();
        assert!(matches!(outcome, VoteOutcome::NoVotes { .. }));
        assert!(orch.router().pending(routed.primitive_id).await.is_some());
    }

    #[tokio::test]
    async fn test_delegate_to_unknown_agent() {
        let orch = orchestrator();
        let pid = orch
            .kernel()
            .create(vec!["A".to_string()], Context::new())
            .await
            .unwrap();
        let _a = orch.register_agent(CapabilityDeclaration::new("a", 1.0)).await.unwrap();

        let err = orch.delegate(pid, "a", "ghost").await.unwrap_err();
        assert!(matches!(err, SpiralError::UnknownAgent { .. }));
        assert!(orch.ledger().is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down() {
        let orch = orchestrator();
        let _a = orch.register_agent(CapabilityDeclaration::new("a", 1.0)).await.unwrap();
        orch.submit(storage_intent("ui").build().unwrap()).await;

        orch.shutdown().await;

        assert!(orch.registry().is_empty().await);
        assert!(!orch.bus().is_registered("a").await);
        assert!(orch.router().pending_ids().await.is_empty());
        assert!(!orch.submit(storage_intent("ui").build().unwrap()).await.success);
    }

    #[tokio::test]
    async fn test_timeout_notifies_requester() {
        let orch = orchestrator();
        let mut x = orch.register_agent(CapabilityDeclaration::new("x", 1.0)).await.unwrap();
        let routed = orch
            .router()
            .route(
                storage_intent("x")
                    .deadline(chrono::Duration::seconds(5))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        let report = orch.tick(Utc::now() + chrono::Duration::seconds(6)).await;
        assert_eq!(report.expired.len(), 1);

        let msg = x.try_recv().unwrap();
        assert_eq!(msg.kind, MessageKind::Notify);
        let resolution: Resolution = msg.body().unwrap();
        assert_eq!(resolution.primitive_id, routed.primitive_id);
        assert_eq!(resolution.status, spiral_core::ResolutionStatus::Timeout);
        assert!(x.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_selection_reaches_each_requester_once() {
        let orch = orchestrator();
        let mut x = orch.register_agent(CapabilityDeclaration::new("x", 1.0)).await.unwrap();
        let mut y = orch.register_agent(CapabilityDeclaration::new("y", 1.0)).await.unwrap();
        let scope = Context::from([("domain".to_string(), "storage".into())]);
        orch.subscribe("x", &scope).await.unwrap();

        let routed = orch
            .router()
            .route(storage_intent("x").context("user", "ana").build().unwrap())
            .await
            .unwrap();
        orch.router()
            .route(storage_intent("y").context("user", "bo").build().unwrap())
            .await
            .unwrap();

        let outcome = orch.propose(routed.primitive_id, "y", "A").await.unwrap();
        assert!(matches!(outcome, ProposalOutcome::Selected(_)));

        for mailbox in [&mut x, &mut y] {
            let msg = mailbox.try_recv().unwrap();
            let resolution: Resolution = msg.body().unwrap();
            assert_eq!(resolution.selected.as_deref(), Some("A"));
            assert!(mailbox.try_recv().is_none());
        }
        assert!(lock_gates(&orch.gates).is_empty());
    }

    #[tokio::test]
    async fn test_vote_releases_its_tap() {
        let orch = orchestrator();
        let routed = orch
            .router()
            .route(storage_intent("ui").build().unwrap())
            .await
            .unwrap();

        let outcome = orch
            .run_vote(routed.primitive_id, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(matches!(outcome, VoteOutcome::NoVotes { .. }));
        assert_eq!(orch.bus().tap_count().await, 0);
        assert_eq!(orch.open_rounds(), 0);
        assert!(lock_gates(&orch.gates).is_empty());
    }

    #[tokio::test]
    async fn test_undo_reopens_original_route() {
        let orch = orchestrator();
        let routed = orch
            .router()
            .route(
                storage_intent("x")
                    .deadline(chrono::Duration::seconds(30))
                    .default_option("C")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        orch.propose(routed.primitive_id, "x", "A").await.unwrap();
        assert!(orch.router().pending(routed.primitive_id).await.is_none());

        orch.undo(routed.tree_id).await.unwrap();

        let route = orch.router().pending(routed.primitive_id).await.unwrap();
        assert_eq!(route.requesters, vec!["x".to_string()]);
        assert_eq!(route.default_option.as_deref(), Some("C"));
        assert!(route.deadline_at.is_some());
        assert_eq!(route.scope.len(), 1);
        assert!(route.proposals.is_empty());
    }
}
