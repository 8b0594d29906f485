//! The message bus: mailboxes, topics and the correlation table.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spiral_core::{AgentId, Result, SpiralError};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{Message, MessageKind, Recipient, Topic};

/// Configuration for the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages buffered per mailbox before senders suspend.
    pub mailbox_capacity: usize,

    /// Messages buffered per topic tap.
    pub tap_capacity: usize,

    /// How long a REQUEST may wait for its RESPONSE (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 100,
            tap_capacity: 256,
            request_timeout_ms: 5_000,
        }
    }
}

/// The receiving end of a registered endpoint.
pub struct Mailbox {
    /// The endpoint this mailbox belongs to.
    pub endpoint: AgentId,

    rx: mpsc::Receiver<Message>,
}

impl Mailbox {
    /// Receive the next message. Returns None once the endpoint is unregistered.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Receive a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// An outstanding REQUEST.
struct Outstanding {
    requester: AgentId,
    sent_at: DateTime<Utc>,
    waiter: Option<oneshot::Sender<Message>>,
}

/// Routes messages between registered endpoints.
pub struct MessageBus {
    config: BusConfig,
    mailboxes: RwLock<HashMap<AgentId, mpsc::Sender<Message>>>,
    topics: RwLock<HashMap<Topic, BTreeSet<AgentId>>>,
    taps: RwLock<HashMap<Topic, broadcast::Sender<Message>>>,
    outstanding: Mutex<HashMap<Uuid, Outstanding>>,
}

impl MessageBus {
    /// Create a new bus.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            mailboxes: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            taps: RwLock::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register an endpoint and return its mailbox.
    pub async fn register(&self, endpoint: impl Into<AgentId>) -> Result<Mailbox> {
        let endpoint = endpoint.into();
        let mut mailboxes = self.mailboxes.write().await;
        if mailboxes.contains_key(&endpoint) {
            return Err(SpiralError::AgentAlreadyRegistered { agent_id: endpoint });
        }

        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        mailboxes.insert(endpoint.clone(), tx);
        debug!("Registered bus endpoint '{}'", endpoint);

        Ok(Mailbox { endpoint, rx })
    }

    /// Remove an endpoint, its topic subscriptions and the requests it is waiting on.
    pub async fn unregister(&self, endpoint: &str) -> bool {
        let removed = self.mailboxes.write().await.remove(endpoint).is_some();

        let mut topics = self.topics.write().await;
        for subscribers in topics.values_mut() {
            subscribers.remove(endpoint);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
        drop(topics);

        self.outstanding
            .lock()
            .await
            .retain(|_, o| o.requester != endpoint);

        if removed {
            debug!("Unregistered bus endpoint '{}'", endpoint);
        }
        removed
    }

    /// Check if an endpoint is registered.
    pub async fn is_registered(&self, endpoint: &str) -> bool {
        self.mailboxes.read().await.contains_key(endpoint)
    }

    /// Subscribe an endpoint to a topic.
    pub async fn subscribe(&self, endpoint: &str, topic: Topic) -> Result<()> {
        if !self.is_registered(endpoint).await {
            return Err(SpiralError::UnknownAgent {
                agent_id: endpoint.to_string(),
            });
        }
        self.topics
            .write()
            .await
            .entry(topic)
            .or_default()
            .insert(endpoint.to_string());
        Ok(())
    }

    /// Unsubscribe an endpoint from a topic.
    pub async fn unsubscribe(&self, endpoint: &str, topic: &Topic) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(endpoint);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Current subscribers of a topic, in id order.
    pub async fn subscribers(&self, topic: &Topic) -> Vec<AgentId> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Observe every broadcast on a topic without holding a mailbox.
    pub async fn tap(&self, topic: Topic) -> broadcast::Receiver<Message> {
        let mut taps = self.taps.write().await;
        taps.entry(topic)
            .or_insert_with(|| broadcast::channel(self.config.tap_capacity).0)
            .subscribe()
    }

    /// Drop a topic's tap once nobody observes it. Returns true if it was removed.
    pub async fn untap(&self, topic: &Topic) -> bool {
        let mut taps = self.taps.write().await;
        match taps.get(topic) {
            Some(tx) if tx.receiver_count() == 0 => {
                taps.remove(topic);
                true
            }
            _ => false,
        }
    }

    /// Number of topics with a live tap.
    pub async fn tap_count(&self) -> usize {
        self.taps.read().await.len()
    }

    /// Number of REQUESTs still waiting for a RESPONSE.
    pub async fn outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    /// Send a message.
    ///
    /// Returns the number of endpoints the message was delivered to. Senders
    /// suspend while a recipient's mailbox is full.
    pub async fn send(&self, mut msg: Message) -> Result<usize> {
        match msg.kind {
            MessageKind::Request => {
                let correlation_id = *msg.correlation_id.get_or_insert_with(Uuid::new_v4);
                self.track(correlation_id, &msg.sender, None).await;
                let delivered = self.deliver(msg).await;
                if delivered.is_err() {
                    self.outstanding.lock().await.remove(&correlation_id);
                }
                delivered
            }
            MessageKind::Response => {
                let correlation_id = msg
                    .correlation_id
                    .ok_or(SpiralError::UnknownCorrelation {
                        correlation_id: Uuid::nil(),
                    })?;
                let outstanding = self
                    .outstanding
                    .lock()
                    .await
                    .remove(&correlation_id)
                    .ok_or(SpiralError::UnknownCorrelation { correlation_id })?;

                match outstanding.waiter {
                    Some(waiter) => {
                        waiter.send(msg).map_err(|_| SpiralError::MailboxClosed {
                            endpoint: outstanding.requester,
                        })?;
                        Ok(1)
                    }
                    None => self.deliver(msg).await,
                }
            }
            _ if msg.kind.is_broadcast() => match msg.recipient.clone() {
                Recipient::Topic(topic) => Ok(self.publish(&topic, msg).await),
                Recipient::Agent(_) => self.deliver(msg).await,
            },
            _ => self.deliver(msg).await,
        }
    }

    /// Send a REQUEST and wait for its RESPONSE.
    ///
    /// The correlation id is retired whether a RESPONSE arrives or the wait
    /// times out.
    pub async fn request(&self, mut msg: Message, timeout: Option<Duration>) -> Result<Message> {
        if msg.kind != MessageKind::Request {
            return Err(SpiralError::Internal(format!(
                "request() needs a REQUEST, got {:?}",
                msg.kind
            )));
        }

        let correlation_id = *msg.correlation_id.get_or_insert_with(Uuid::new_v4);
        let (tx, rx) = oneshot::channel();
        self.track(correlation_id, &msg.sender, Some(tx)).await;

        if let Err(e) = self.deliver(msg).await {
            self.outstanding.lock().await.remove(&correlation_id);
            return Err(e);
        }

        let limit = timeout.unwrap_or(Duration::from_millis(self.config.request_timeout_ms));
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Waiter dropped: the correlation was expired or its requester unregistered.
            Ok(Err(_)) | Err(_) => {
                self.outstanding.lock().await.remove(&correlation_id);
                warn!("Request {} timed out after {:?}", correlation_id, limit);
                Err(SpiralError::Timeout {
                    duration_ms: limit.as_millis() as u64,
                    message: format!("no response for request {}", correlation_id),
                })
            }
        }
    }

    /// Retire correlations older than the request timeout.
    pub async fn expire_requests(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let cutoff = now - chrono::Duration::milliseconds(self.config.request_timeout_ms as i64);
        let mut outstanding = self.outstanding.lock().await;

        let expired: Vec<Uuid> = outstanding
            .iter()
            .filter(|(_, o)| o.sent_at <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            outstanding.remove(id);
        }

        if !expired.is_empty() {
            warn!("Expired {} unanswered requests", expired.len());
        }
        expired
    }

    async fn track(&self, correlation_id: Uuid, requester: &str, waiter: Option<oneshot::Sender<Message>>) {
        self.outstanding.lock().await.insert(
            correlation_id,
            Outstanding {
                requester: requester.to_string(),
                sent_at: Utc::now(),
                waiter,
            },
        );
    }

    async fn deliver(&self, msg: Message) -> Result<usize> {
        let Recipient::Agent(target) = &msg.recipient else {
            return Err(SpiralError::Internal(format!(
                "{:?} messages must address an agent",
                msg.kind
            )));
        };

        let tx = self
            .mailboxes
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| SpiralError::UnknownAgent {
                agent_id: target.clone(),
            })?;

        let endpoint = target.clone();
        tx.send(msg)
            .await
            .map_err(|_| SpiralError::MailboxClosed { endpoint })?;
        Ok(1)
    }

    async fn publish(&self, topic: &Topic, msg: Message) -> usize {
        let subscribers = self.subscribers(topic).await;
        let targets: Vec<(AgentId, mpsc::Sender<Message>)> = {
            let mailboxes = self.mailboxes.read().await;
            subscribers
                .into_iter()
                .filter(|s| *s != msg.sender)
                .filter_map(|s| mailboxes.get(&s).cloned().map(|tx| (s, tx)))
                .collect()
        };

        let mut delivered = 0;
        for (endpoint, tx) in targets {
            if tx.send(msg.clone()).await.is_ok() {
                delivered += 1;
            } else {
                warn!("Dropped {:?} for closed mailbox '{}'", msg.kind, endpoint);
            }
        }

        if let Some(tap) = self.taps.read().await.get(topic) {
            let _ = tap.send(msg);
        }

        debug!("Published to {} ({} recipients)", topic, delivered);
        delivered
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_core::context::context;
    use spiral_core::Context;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_twice_fails() {
        let bus = MessageBus::default();
        let _mb = bus.register("a").await.unwrap();
        assert!(matches!(
            bus.register("a").await,
            Err(SpiralError::AgentAlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_fifo_per_pair() {
        let bus = MessageBus::default();
        let _a = bus.register("a").await.unwrap();
        let mut b = bus.register("b").await.unwrap();

        for i in 0..5 {
            bus.send(Message::delegate("a", "b", Context::new()).with("seq", i))
                .await
                .unwrap();
        }

        for i in 0..5 {
            let msg = b.recv().await.unwrap();
            assert_eq!(msg.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_responses_correlate_in_request_order() {
        let bus = MessageBus::default();
        let mut a = bus.register("a").await.unwrap();
        let mut b = bus.register("b").await.unwrap();

        let mut sent = Vec::new();
        for _ in 0..3 {
            let req = Message::request("a", "b", Context::new());
            sent.push(req.correlation_id);
            bus.send(req).await.unwrap();
        }
        assert_eq!(bus.outstanding().await, 3);

        for _ in 0..3 {
            let req = b.recv().await.unwrap();
            bus.send(Message::response_to(&req, "b")).await.unwrap();
        }

        for expected in sent {
            let resp = a.recv().await.unwrap();
            assert_eq!(resp.correlation_id, expected);
        }
        assert_eq!(bus.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_correlation_rejected() {
        let bus = MessageBus::default();
        let _a = bus.register("a").await.unwrap();
        let _b = bus.register("b").await.unwrap();

        let req = Message::request("a", "b", Context::new());
        let stray = Message::response_to(&req, "b");
        let err = bus.send(stray).await.unwrap_err();
        assert!(matches!(err, SpiralError::UnknownCorrelation { .. }));
    }

    #[tokio::test]
    async fn test_correlation_retired_after_response() {
        let bus = MessageBus::default();
        let _a = bus.register("a").await.unwrap();
        let mut b = bus.register("b").await.unwrap();

        bus.send(Message::request("a", "b", Context::new())).await.unwrap();
        let req = b.recv().await.unwrap();
        bus.send(Message::response_to(&req, "b")).await.unwrap();

        let err = bus.send(Message::response_to(&req, "b")).await.unwrap_err();
        assert!(matches!(err, SpiralError::UnknownCorrelation { .. }));
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let bus = Arc::new(MessageBus::default());
        let _a = bus.register("a").await.unwrap();
        let mut b = bus.register("b").await.unwrap();

        let responder = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let req = b.recv().await.unwrap();
                bus.send(Message::response_to(&req, "b").with("answer", 42))
                    .await
                    .unwrap();
            })
        };

        let resp = bus
            .request(Message::request("a", "b", Context::new()), None)
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(resp.payload["answer"], 42);
        assert_eq!(bus.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_request_timeout_retires_correlation() {
        let bus = MessageBus::default();
        let _a = bus.register("a").await.unwrap();
        let _b = bus.register("b").await.unwrap();

        let err = bus
            .request(
                Message::request("a", "b", Context::new()),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SpiralError::Timeout { .. }));
        assert_eq!(bus.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_expire_requests() {
        let bus = MessageBus::default();
        let _a = bus.register("a").await.unwrap();
        let _b = bus.register("b").await.unwrap();
        bus.send(Message::request("a", "b", Context::new())).await.unwrap();

        assert!(bus.expire_requests(Utc::now()).await.is_empty());
        let later = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(bus.expire_requests(later).await.len(), 1);
        assert_eq!(bus.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_topic_broadcast_skips_sender() {
        let bus = MessageBus::default();
        let mut a = bus.register("a").await.unwrap();
        let mut b = bus.register("b").await.unwrap();
        let mut c = bus.register("c").await.unwrap();

        let ctx = context([("domain", "storage")]);
        let topic = Topic::of(&ctx);
        for id in ["a", "b", "c"] {
            bus.subscribe(id, topic.clone()).await.unwrap();
        }
        let mut tap = bus.tap(topic.clone()).await;

        let delivered = bus.send(Message::notify("a", topic, ctx)).await.unwrap();
        assert_eq!(delivered, 2);

        assert!(b.recv().await.is_some());
        assert!(c.recv().await.is_some());
        assert!(a.try_recv().is_none());
        assert_eq!(tap.recv().await.unwrap().sender, "a");
    }

    #[tokio::test]
    async fn test_untap_waits_for_last_observer() {
        let bus = MessageBus::default();
        let topic = Topic::named("votes");

        let first = bus.tap(topic.clone()).await;
        let second = bus.tap(topic.clone()).await;
        assert_eq!(bus.tap_count().await, 1);

        drop(first);
        assert!(!bus.untap(&topic).await);
        assert_eq!(bus.tap_count().await, 1);

        drop(second);
        assert!(bus.untap(&topic).await);
        assert_eq!(bus.tap_count().await, 0);
    }

    #[tokio::test]
    async fn test_direct_notify_reaches_one_agent() {
        let bus = MessageBus::default();
        let mut a = bus.register("a").await.unwrap();
        let mut b = bus.register("b").await.unwrap();

        let delivered = bus
            .send(Message::notify_agent("core", "a", Context::new()))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(a.recv().await.unwrap().kind, MessageKind::Notify);
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unregister_cleans_up() {
        let bus = MessageBus::default();
        let _a = bus.register("a").await.unwrap();
        let _b = bus.register("b").await.unwrap();
        let topic = Topic::named("t");
        bus.subscribe("a", topic.clone()).await.unwrap();
        bus.send(Message::request("a", "b", Context::new())).await.unwrap();

        assert!(bus.unregister("a").await);
        assert!(bus.subscribers(&topic).await.is_empty());
        assert_eq!(bus.outstanding().await, 0);

        let err = bus
            .send(Message::delegate("b", "a", Context::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SpiralError::UnknownAgent { .. }));
    }
}
