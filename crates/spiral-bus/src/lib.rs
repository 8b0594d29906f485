//! # Spiral Bus
//!
//! Message shape and delivery for agents and the coordination core.
//!
//! Guarantees:
//! - FIFO delivery for each (sender, recipient) pair
//! - At-most-once delivery; re-sends are not deduplicated
//! - Every RESPONSE must answer an outstanding REQUEST
//! - NOTIFY and VOTE fan out to the subscribers of a context topic

pub mod bus;
pub mod message;

pub use bus::{BusConfig, Mailbox, MessageBus};
pub use message::{Message, MessageKind, Recipient, Topic};
