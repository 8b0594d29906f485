//! Error types for the Spiral coordination core.

use thiserror::Error;
use uuid::Uuid;

use crate::types::{AgentId, OptionId, PrimitiveId, TreeId};

/// Main error type for Spiral operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpiralError {
    /// A primitive was declared without any options.
    #[error("Option set is empty")]
    EmptyOptionSet,

    /// A primitive was declared with the same option twice.
    #[error("Duplicate option '{option}' in option set")]
    DuplicateOption { option: OptionId },

    /// Intent validation failed.
    #[error("Intent validation failed: {message}")]
    IntentInvalid { intent_id: Option<Uuid>, message: String },

    /// No primitive with this id is known to the kernel.
    #[error("Unknown primitive {primitive_id}")]
    UnknownPrimitive { primitive_id: PrimitiveId },

    /// No tree with this id is known to the kernel.
    #[error("Unknown tree {tree_id}")]
    UnknownTree { tree_id: TreeId },

    /// The option is not part of the primitive's option set.
    #[error("Option '{option}' is not offered by primitive {primitive_id}")]
    InvalidOption {
        primitive_id: PrimitiveId,
        option: OptionId,
    },

    /// The primitive was already resolved to a different option.
    #[error("Primitive {primitive_id} already resolved to '{selected}', cannot select '{requested}'")]
    AlreadyResolved {
        primitive_id: PrimitiveId,
        selected: OptionId,
        requested: OptionId,
    },

    /// The tree history is empty.
    #[error("Nothing to undo in tree {tree_id}")]
    NothingToUndo { tree_id: TreeId },

    /// No undone selection is waiting to be re-applied.
    #[error("Nothing to redo in tree {tree_id}")]
    NothingToRedo { tree_id: TreeId },

    /// A RESPONSE referenced a correlation id with no outstanding REQUEST.
    #[error("Unknown correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: Uuid },

    /// A delegation would hand the context back to an agent already in the chain.
    #[error("Delegation of {context_id} to '{target}' would form a cycle; returned to '{returned_to}'")]
    DelegationCycle {
        context_id: PrimitiveId,
        target: AgentId,
        chain: Vec<AgentId>,
        returned_to: AgentId,
    },

    /// The agent delegating a context does not currently hold it.
    #[error("Agent '{agent_id}' does not hold context {context_id} (held by '{holder}')")]
    NotDelegationHolder {
        context_id: PrimitiveId,
        agent_id: AgentId,
        holder: AgentId,
    },

    /// Operation timed out.
    #[error("Operation timed out after {duration_ms}ms: {message}")]
    Timeout { duration_ms: u64, message: String },

    /// No live agent with this id is registered.
    #[error("Unknown agent '{agent_id}'")]
    UnknownAgent { agent_id: AgentId },

    /// An agent with this id is already registered and live.
    #[error("Agent '{agent_id}' is already registered")]
    AgentAlreadyRegistered { agent_id: AgentId },

    /// The agent has been terminated and cannot transition further.
    #[error("Agent '{agent_id}' is terminated")]
    AgentTerminated { agent_id: AgentId },

    /// A voting round is already collecting ballots for this primitive.
    #[error("A voting round is already open for primitive {primitive_id}")]
    RoundInProgress { primitive_id: PrimitiveId },

    /// Snapshot payload failed verification or decoding.
    #[error("Snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// The recipient's mailbox is gone.
    #[error("Mailbox closed for '{endpoint}'")]
    MailboxClosed { endpoint: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpiralError {
    /// Returns true if the caller can recover, e.g. by re-proposing via voting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpiralError::AlreadyResolved { .. }
                | SpiralError::Timeout { .. }
                | SpiralError::MailboxClosed { .. }
        )
    }

    /// Returns true if the error ends the operation with no retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SpiralError::DelegationCycle { .. }
                | SpiralError::EmptyOptionSet
                | SpiralError::DuplicateOption { .. }
        )
    }

    /// Returns the primitive ID if available.
    pub fn primitive_id(&self) -> Option<PrimitiveId> {
        match self {
            SpiralError::UnknownPrimitive { primitive_id } => Some(*primitive_id),
            SpiralError::InvalidOption { primitive_id, .. } => Some(*primitive_id),
            SpiralError::AlreadyResolved { primitive_id, .. } => Some(*primitive_id),
            SpiralError::RoundInProgress { primitive_id } => Some(*primitive_id),
            SpiralError::DelegationCycle { context_id, .. } => Some(*context_id),
            SpiralError::NotDelegationHolder { context_id, .. } => Some(*context_id),
            _ => None,
        }
    }

    /// Short machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            SpiralError::IntentInvalid { .. } => "intent_invalid",
            SpiralError::EmptyOptionSet => "empty_option_set",
            SpiralError::DuplicateOption { .. } => "duplicate_option",
            SpiralError::UnknownPrimitive { .. } => "unknown_primitive",
            SpiralError::UnknownTree { .. } => "unknown_tree",
            SpiralError::InvalidOption { .. } => "invalid_option",
            SpiralError::AlreadyResolved { .. } => "already_resolved",
            SpiralError::NothingToUndo { .. } => "nothing_to_undo",
            SpiralError::NothingToRedo { .. } => "nothing_to_redo",
            SpiralError::UnknownCorrelation { .. } => "unknown_correlation",
            SpiralError::DelegationCycle { .. } => "delegation_cycle",
            SpiralError::NotDelegationHolder { .. } => "not_delegation_holder",
            SpiralError::Timeout { .. } => "timeout",
            SpiralError::UnknownAgent { .. } => "unknown_agent",
            SpiralError::AgentAlreadyRegistered { .. } => "agent_already_registered",
            SpiralError::AgentTerminated { .. } => "agent_terminated",
            SpiralError::RoundInProgress { .. } => "round_in_progress",
            SpiralError::SnapshotCorrupt(_) => "snapshot_corrupt",
            SpiralError::MailboxClosed { .. } => "mailbox_closed",
            SpiralError::SerializationError(_) => "serialization_error",
            SpiralError::Internal(_) => "internal",
        }
    }
}

/// Convenience Result type for Spiral operations.
pub type Result<T> = std::result::Result<T, SpiralError>;

impl From<serde_json::Error> for SpiralError {
    fn from(err: serde_json::Error) -> Self {
        SpiralError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let resolved = SpiralError::AlreadyResolved {
            primitive_id: Uuid::new_v4(),
            selected: "A".to_string(),
            requested: "B".to_string(),
        };
        assert!(resolved.is_recoverable());
        assert!(!resolved.is_fatal());

        let cycle = SpiralError::DelegationCycle {
            context_id: Uuid::new_v4(),
            target: "a".to_string(),
            chain: vec!["a".to_string(), "b".to_string()],
            returned_to: "a".to_string(),
        };
        assert!(cycle.is_fatal());
        assert!(!cycle.is_recoverable());
        assert_eq!(cycle.code(), "delegation_cycle");
    }

    #[test]
    fn test_primitive_id_extraction() {
        let id = Uuid::new_v4();
        let err = SpiralError::InvalidOption {
            primitive_id: id,
            option: "Z".to_string(),
        };
        assert_eq!(err.primitive_id(), Some(id));
        assert_eq!(SpiralError::EmptyOptionSet.primitive_id(), None);
    }
}
