//! # Spiral Core
//!
//! Core primitives and types for the Spiral coordination core.
//!
//! This crate provides the fundamental building blocks:
//! - [`ChoicePrimitive`] - An explicit, eventually-terminal decision point
//! - [`ChoiceTree`] - A root primitive plus everything its selections spawned
//! - [`HistoryEntry`] - Append-only record of selection transitions
//! - [`SpiralError`] - Protocol error types

pub mod context;
pub mod error;
pub mod expansion;
pub mod primitive;
pub mod tree;
pub mod types;

// Re-exports for convenience
pub use context::{Context, ContextValue};
pub use error::{Result, SpiralError};
pub use expansion::{Expansion, NoExpansion};
pub use primitive::{ChoicePrimitive, NodeState};
pub use tree::{ChoiceTree, HistoryEntry, SelectionOutcome, TreeConfig, UndoOutcome};
pub use types::*;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::context::{Context, ContextValue};
    pub use crate::error::{Result, SpiralError};
    pub use crate::expansion::{Expansion, NoExpansion};
    pub use crate::primitive::{ChoicePrimitive, NodeState};
    pub use crate::tree::{ChoiceTree, HistoryEntry, SelectionOutcome, TreeConfig, UndoOutcome};
    pub use crate::types::{
        AgentId, OptionId, PrimitiveId, ProducerResult, Resolution, ResolutionPolicy,
        ResolutionStatus, TreeId,
    };
}
