//! # Spiral Router
//!
//! Matches incoming intents to pending choice primitives, creating new ones
//! through the kernel when nothing matches, and owns the deadline and
//! default-resolution policy for every routed primitive.

pub mod intent;
pub mod router;

pub use intent::{Intent, IntentBuilder};
pub use router::{ChoiceRouter, Expired, PendingRoute, Proposal, RouteOutcome, RouterConfig};
