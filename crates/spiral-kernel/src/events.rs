//! Kernel event feed: the audit trail of tree transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spiral_core::{OptionId, PrimitiveId, TreeId};
use tokio::sync::broadcast;
use tracing::warn;

/// A transition applied by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    /// Type of transition.
    pub kind: KernelEventKind,

    /// The tree that changed.
    pub tree_id: TreeId,

    /// The primitive the transition targeted, if any.
    pub primitive_id: Option<PrimitiveId>,

    /// The option involved, if any.
    pub option: Option<OptionId>,

    /// Primitives created or removed by the transition.
    pub affected: Vec<PrimitiveId>,

    /// Timestamp of the transition.
    pub timestamp: DateTime<Utc>,
}

/// Type of kernel transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelEventKind {
    /// New tree created.
    Created,
    /// Option selected on a primitive.
    Selected,
    /// Lazy children materialized.
    Expanded,
    /// Selection reverted.
    Undone,
    /// Undone selection re-applied.
    Redone,
    /// Tree reverted to its bare root.
    Reset,
    /// Tree restored from a snapshot.
    Restored,
}

impl KernelEvent {
    /// Create an event stamped now.
    pub fn new(kind: KernelEventKind, tree_id: TreeId) -> Self {
        Self {
            kind,
            tree_id,
            primitive_id: None,
            option: None,
            affected: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the targeted primitive.
    pub fn primitive(mut self, id: PrimitiveId) -> Self {
        self.primitive_id = Some(id);
        self
    }

    /// Set the option involved.
    pub fn option(mut self, option: impl Into<OptionId>) -> Self {
        self.option = Some(option.into());
        self
    }

    /// Set the affected primitives.
    pub fn affected(mut self, ids: Vec<PrimitiveId>) -> Self {
        self.affected = ids;
        self
    }
}

/// Filter for event subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events of this tree.
    pub tree_id: Option<TreeId>,

    /// Only these kinds of events.
    pub kinds: Option<Vec<KernelEventKind>>,
}

impl EventFilter {
    /// Create a filter for a single tree.
    pub fn tree(tree_id: TreeId) -> Self {
        Self {
            tree_id: Some(tree_id),
            ..Default::default()
        }
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: Vec<KernelEventKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &KernelEvent) -> bool {
        if let Some(tree_id) = self.tree_id {
            if event.tree_id != tree_id {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        true
    }
}

/// A filtered subscription to kernel events.
pub struct KernelSubscription {
    /// Filter for this subscription.
    pub filter: EventFilter,

    receiver: broadcast::Receiver<KernelEvent>,
}

impl KernelSubscription {
    pub(crate) fn new(filter: EventFilter, receiver: broadcast::Receiver<KernelEvent>) -> Self {
        Self { filter, receiver }
    }

    /// Wait for the next matching event. Returns `None` once the kernel is dropped.
    pub async fn next(&mut self) -> Option<KernelEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Kernel subscription lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
