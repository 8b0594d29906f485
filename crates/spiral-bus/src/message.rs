//! Bus message types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use spiral_core::context::canonical;
use spiral_core::{AgentId, Context, Result, SpiralError};
use uuid::Uuid;

/// Kind of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Asks the recipient for a RESPONSE.
    Request,
    /// Answers a REQUEST with the same correlation id.
    Response,
    /// Broadcast information.
    Notify,
    /// Hands a choice context to another agent.
    Delegate,
    /// A ballot or a call for ballots.
    Vote,
}

impl MessageKind {
    /// Check if this kind is fanned out to a topic.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, MessageKind::Notify | MessageKind::Vote)
    }
}

/// A broadcast channel derived from a choice context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// The topic for a choice context.
    pub fn of(context: &Context) -> Self {
        Self(format!("ctx:{}", canonical(context)))
    }

    /// A topic with an explicit name.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    /// A single registered endpoint.
    Agent(AgentId),
    /// Every subscriber of a topic.
    Topic(Topic),
}

/// A message passed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique ID for this message.
    pub id: Uuid,

    /// The sending endpoint.
    pub sender: AgentId,

    /// The addressee.
    pub recipient: Recipient,

    /// Kind of message.
    pub kind: MessageKind,

    /// The choice context this message concerns.
    pub context: Context,

    /// Free-form payload.
    pub payload: serde_json::Map<String, serde_json::Value>,

    /// Timestamp when the message was created.
    pub timestamp: DateTime<Utc>,

    /// Links a REQUEST to its RESPONSE.
    pub correlation_id: Option<Uuid>,
}

impl Message {
    fn new(sender: impl Into<AgentId>, recipient: Recipient, kind: MessageKind, context: Context) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient,
            kind,
            context,
            payload: serde_json::Map::new(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// A REQUEST with a fresh correlation id.
    pub fn request(sender: impl Into<AgentId>, to: impl Into<AgentId>, context: Context) -> Self {
        let mut msg = Self::new(sender, Recipient::Agent(to.into()), MessageKind::Request, context);
        msg.correlation_id = Some(Uuid::new_v4());
        msg
    }

    /// The RESPONSE to a request, addressed back to its sender.
    pub fn response_to(request: &Message, sender: impl Into<AgentId>) -> Self {
        let mut msg = Self::new(
            sender,
            Recipient::Agent(request.sender.clone()),
            MessageKind::Response,
            request.context.clone(),
        );
        msg.correlation_id = request.correlation_id;
        msg
    }

    /// A NOTIFY for the subscribers of a topic.
    pub fn notify(sender: impl Into<AgentId>, topic: Topic, context: Context) -> Self {
        Self::new(sender, Recipient::Topic(topic), MessageKind::Notify, context)
    }

    /// A NOTIFY addressed to one agent.
    pub fn notify_agent(sender: impl Into<AgentId>, to: impl Into<AgentId>, context: Context) -> Self {
        Self::new(sender, Recipient::Agent(to.into()), MessageKind::Notify, context)
    }

    /// A VOTE for the subscribers of a topic.
    pub fn vote(sender: impl Into<AgentId>, topic: Topic, context: Context) -> Self {
        Self::new(sender, Recipient::Topic(topic), MessageKind::Vote, context)
    }

    /// A DELEGATE handing a context to another agent.
    pub fn delegate(sender: impl Into<AgentId>, to: impl Into<AgentId>, context: Context) -> Self {
        Self::new(sender, Recipient::Agent(to.into()), MessageKind::Delegate, context)
    }

    /// Add a payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replace the payload with a serialized body. The body must serialize to an object.
    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        match serde_json::to_value(body)? {
            serde_json::Value::Object(map) => {
                self.payload = map;
                Ok(self)
            }
            other => Err(SpiralError::SerializationError(format!(
                "message body must be an object, got {}",
                other
            ))),
        }
    }

    /// Decode the payload into a typed body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::Value::Object(self.payload.clone()))?)
    }

    /// The addressed agent, if the message is not a broadcast.
    pub fn target_agent(&self) -> Option<&str> {
        match &self.recipient {
            Recipient::Agent(id) => Some(id),
            Recipient::Topic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_core::context::context;

    #[test]
    fn test_topic_from_context_is_order_independent() {
        let a = context([("domain", "storage"), ("user", "ana")]);
        let b = context([("user", "ana"), ("domain", "storage")]);
        assert_eq!(Topic::of(&a), Topic::of(&b));
        assert_eq!(Topic::of(&a).as_str(), "ctx:domain=storage,user=ana");
    }

    #[test]
    fn test_response_correlates_to_request() {
        let req = Message::request("a", "b", Context::new());
        let resp = Message::response_to(&req, "b");

        assert!(req.correlation_id.is_some());
        assert_eq!(resp.correlation_id, req.correlation_id);
        assert_eq!(resp.target_agent(), Some("a"));
        assert_eq!(resp.kind, MessageKind::Response);
    }

    #[test]
    fn test_typed_body() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Ping {
            seq: u32,
        }

        let msg = Message::notify("a", Topic::named("t"), Context::new())
            .with_body(&Ping { seq: 7 })
            .unwrap();
        assert_eq!(msg.body::<Ping>().unwrap(), Ping { seq: 7 });

        let err = Message::notify("a", Topic::named("t"), Context::new()).with_body(&3);
        assert!(matches!(err, Err(SpiralError::SerializationError(_))));
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::vote("a", Topic::named("t"), Context::new()).with("option", "B");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"vote\""));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload["option"], "B");
        assert_eq!(back.recipient, Recipient::Topic(Topic::named("t")));
    }
}
