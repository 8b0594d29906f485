//! Common types used across the Spiral coordination core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SpiralError;

/// Identifier of a choice primitive.
pub type PrimitiveId = Uuid;

/// Identifier of a choice tree.
pub type TreeId = Uuid;

/// Identifier of a registered agent.
pub type AgentId = String;

/// Identifier of a single option within a primitive's option set.
pub type OptionId = String;

/// When spiral-expansion children are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Children are created in the same step as the selection (default).
    #[default]
    Eager,
    /// Children are computed on first access and cached.
    Lazy,
}

/// How a routed primitive ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// An option was selected before the deadline.
    Selected,
    /// The deadline passed; the default option may have been applied.
    Timeout,
    /// The route was torn down without a selection.
    Cancelled,
}

/// Outcome reported to everyone waiting on a routed primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// The primitive that was routed.
    pub primitive_id: PrimitiveId,

    /// How the route finished.
    pub status: ResolutionStatus,

    /// The selected option, if any.
    pub selected: Option<OptionId>,

    /// Children spawned by the selection.
    pub spawned: Vec<PrimitiveId>,

    /// When the resolution was reached.
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    /// A resolution produced by a selection.
    pub fn selected(primitive_id: PrimitiveId, option: OptionId, spawned: Vec<PrimitiveId>) -> Self {
        Self {
            primitive_id,
            status: ResolutionStatus::Selected,
            selected: Some(option),
            spawned,
            resolved_at: Utc::now(),
        }
    }

    /// A resolution produced by deadline expiry.
    pub fn timeout(
        primitive_id: PrimitiveId,
        default_applied: Option<OptionId>,
        spawned: Vec<PrimitiveId>,
    ) -> Self {
        Self {
            primitive_id,
            status: ResolutionStatus::Timeout,
            selected: default_applied,
            spawned,
            resolved_at: Utc::now(),
        }
    }

    /// A resolution produced by teardown.
    pub fn cancelled(primitive_id: PrimitiveId) -> Self {
        Self {
            primitive_id,
            status: ResolutionStatus::Cancelled,
            selected: None,
            spawned: Vec::new(),
            resolved_at: Utc::now(),
        }
    }
}

/// What a result producer (connector, UI) receives for a submitted intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerResult {
    /// Whether the intent was handled without error.
    pub success: bool,

    /// Free-form result data.
    pub data: serde_json::Value,

    /// Freshly routed primitives the producer may act on next.
    pub next_choices: Vec<PrimitiveId>,

    /// Error message, if the intent failed.
    pub error: Option<String>,

    /// Primitives the producer can use to recover from a failure.
    pub recovery_choices: Vec<PrimitiveId>,
}

impl ProducerResult {
    /// Create a successful result.
    pub fn ok(data: serde_json::Value, next_choices: Vec<PrimitiveId>) -> Self {
        Self {
            success: true,
            data,
            next_choices,
            error: None,
            recovery_choices: Vec::new(),
        }
    }

    /// Create a failed result carrying recovery choices.
    pub fn failed(error: &SpiralError, recovery_choices: Vec<PrimitiveId>) -> Self {
        Self {
            success: false,
            data: serde_json::json!({ "code": error.code() }),
            next_choices: Vec::new(),
            error: Some(error.to_string()),
            recovery_choices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_eager() {
        assert_eq!(ResolutionPolicy::default(), ResolutionPolicy::Eager);
    }

    #[test]
    fn test_failed_result_carries_code() {
        let result = ProducerResult::failed(&SpiralError::EmptyOptionSet, vec![]);
        assert!(!result.success);
        assert_eq!(result.data["code"], "empty_option_set");
        assert!(result.error.is_some());
    }
}
