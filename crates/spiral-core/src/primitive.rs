//! Choice primitive types.
//!
//! A ChoicePrimitive is the unit of state: one explicit, auditable decision point.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Result, SpiralError};
use crate::types::{OptionId, PrimitiveId, TreeId};

/// Resolution state of a primitive, as recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "option", rename_all = "snake_case")]
pub enum NodeState {
    /// No option selected yet.
    Unresolved,
    /// Terminal: the option was selected.
    Resolved(OptionId),
}

impl NodeState {
    /// The selected option, if any.
    pub fn selected(&self) -> Option<&str> {
        match self {
            NodeState::Unresolved => None,
            NodeState::Resolved(option) => Some(option),
        }
    }
}

/// A decision node with a fixed option set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoicePrimitive {
    /// Unique identifier for this primitive.
    pub id: PrimitiveId,

    /// The tree owning this primitive.
    pub tree_id: TreeId,

    /// Options in declaration order. Order breaks vote ties.
    pub options: Vec<OptionId>,

    /// Context used for routing and matching.
    pub context: Context,

    /// Back-link to the parent primitive (traversal only).
    pub parent: Option<PrimitiveId>,

    /// Distance from the tree root.
    pub depth: u32,

    /// Current resolution state.
    pub state: NodeState,

    /// Timestamp when the primitive was created.
    pub created_at: DateTime<Utc>,
}

/// Check an option set for emptiness and duplicates.
pub fn validate_options(options: &[OptionId]) -> Result<()> {
    if options.is_empty() {
        return Err(SpiralError::EmptyOptionSet);
    }

    let mut seen = HashSet::with_capacity(options.len());
    for option in options {
        if !seen.insert(option.as_str()) {
            return Err(SpiralError::DuplicateOption {
                option: option.clone(),
            });
        }
    }

    Ok(())
}

impl ChoicePrimitive {
    /// Create a new, unresolved primitive.
    pub fn new(
        tree_id: TreeId,
        options: Vec<OptionId>,
        context: Context,
        parent: Option<PrimitiveId>,
        depth: u32,
    ) -> Result<Self> {
        validate_options(&options)?;

        Ok(Self {
            id: Uuid::new_v4(),
            tree_id,
            options,
            context,
            parent,
            depth,
            state: NodeState::Unresolved,
            created_at: Utc::now(),
        })
    }

    /// Check if an option was selected.
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, NodeState::Resolved(_))
    }

    /// The selected option, if any.
    pub fn selected(&self) -> Option<&str> {
        self.state.selected()
    }

    /// Check if the option is offered.
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    /// Declaration position of an option.
    pub fn position_of(&self, option: &str) -> Option<usize> {
        self.options.iter().position(|o| o == option)
    }

    /// Check if this primitive is a tree root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(labels: &[&str]) -> Vec<OptionId> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_primitive_creation() {
        let tree_id = Uuid::new_v4();
        let p = ChoicePrimitive::new(tree_id, opts(&["A", "B", "C"]), Context::new(), None, 0)
            .unwrap();

        assert!(!p.is_resolved());
        assert!(p.is_root());
        assert_eq!(p.position_of("C"), Some(2));
        assert!(!p.has_option("D"));
    }

    #[test]
    fn test_empty_options_rejected() {
        let result = ChoicePrimitive::new(Uuid::new_v4(), vec![], Context::new(), None, 0);
        assert_eq!(result.unwrap_err(), SpiralError::EmptyOptionSet);
    }

    #[test]
    fn test_duplicate_options_rejected() {
        let result =
            ChoicePrimitive::new(Uuid::new_v4(), opts(&["A", "B", "A"]), Context::new(), None, 0);
        assert_eq!(
            result.unwrap_err(),
            SpiralError::DuplicateOption {
                option: "A".to_string()
            }
        );
    }

    #[test]
    fn test_node_state_serialization() {
        let json = serde_json::to_string(&NodeState::Resolved("B".to_string())).unwrap();
        assert_eq!(json, r#"{"state":"resolved","option":"B"}"#);
        let back: NodeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.selected(), Some("B"));
    }
}
