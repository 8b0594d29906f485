//! Choice trees: a root primitive plus every child its selections spawned.
//!
//! Selection is a state transition recorded in an append-only history, which
//! is what makes undo exact. Children keep only a weak id back-link to their
//! parent; ownership lives in the tree's node table.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Result, SpiralError};
use crate::expansion::Expansion;
use crate::primitive::{validate_options, ChoicePrimitive, NodeState};
use crate::types::{OptionId, PrimitiveId, ResolutionPolicy, TreeId};

/// Per-tree configuration, fixed for the tree's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TreeConfig {
    /// When spawned children are materialized.
    pub policy: ResolutionPolicy,

    /// Primitives at this depth or deeper never spawn children.
    pub max_depth: Option<u32>,
}

impl TreeConfig {
    /// Lazy resolution policy.
    pub fn lazy() -> Self {
        Self {
            policy: ResolutionPolicy::Lazy,
            max_depth: None,
        }
    }

    /// Set the maximum expansion depth.
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    fn allows_expansion(&self, depth: u32) -> bool {
        self.max_depth.map_or(true, |max| depth < max)
    }
}

/// Append-only record of one selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The tree the node belongs to.
    pub tree_id: TreeId,

    /// The node whose state changed.
    pub node_id: PrimitiveId,

    /// State before the transition.
    pub prior: NodeState,

    /// State after the transition.
    pub new: NodeState,

    /// Children spawned with the selection (empty under lazy resolution).
    pub spawned: Vec<PrimitiveId>,

    /// When the transition was applied.
    pub timestamp: DateTime<Utc>,
}

/// Result of a successful `select`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    /// The owning tree.
    pub tree_id: TreeId,

    /// The selected primitive.
    pub primitive_id: PrimitiveId,

    /// The option now selected.
    pub option: OptionId,

    /// Children materialized by this selection.
    pub spawned: Vec<PrimitiveId>,

    /// False when the call re-selected the already chosen option.
    pub changed: bool,
}

/// Result of a successful `undo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoOutcome {
    /// The owning tree.
    pub tree_id: TreeId,

    /// The node that was reverted.
    pub primitive_id: PrimitiveId,

    /// The state the node was reverted to.
    pub prior: NodeState,

    /// The state that was undone.
    pub undone: NodeState,

    /// Descendants removed along with the selection.
    pub removed: Vec<PrimitiveId>,
}

/// A root primitive and its spawned descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceTree {
    /// Unique identifier for this tree.
    pub id: TreeId,

    /// The root primitive.
    pub root: PrimitiveId,

    /// Configuration fixed at creation.
    pub config: TreeConfig,

    /// Timestamp when the tree was created.
    pub created_at: DateTime<Utc>,

    nodes: HashMap<PrimitiveId, ChoicePrimitive>,

    /// Materialized children in spawn order.
    children: HashMap<PrimitiveId, Vec<PrimitiveId>>,

    /// Resolved nodes whose expansion already ran.
    expanded: HashSet<PrimitiveId>,

    history: Vec<HistoryEntry>,

    /// Undone entries, most recent last.
    undone: Vec<HistoryEntry>,
}

impl ChoiceTree {
    /// Create a tree with a fresh, unresolved root.
    pub fn new(options: Vec<OptionId>, context: Context, config: TreeConfig) -> Result<Self> {
        let id = Uuid::new_v4();
        let root = ChoicePrimitive::new(id, options, context, None, 0)?;
        let root_id = root.id;

        let mut nodes = HashMap::new();
        nodes.insert(root_id, root);

        Ok(Self {
            id,
            root: root_id,
            config,
            created_at: Utc::now(),
            nodes,
            children: HashMap::new(),
            expanded: HashSet::new(),
            history: Vec::new(),
            undone: Vec::new(),
        })
    }

    /// Get a primitive by ID.
    pub fn get(&self, id: PrimitiveId) -> Option<&ChoicePrimitive> {
        self.nodes.get(&id)
    }

    /// Check if the primitive lives in this tree.
    pub fn contains(&self, id: PrimitiveId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of live primitives.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a tree has at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All live primitive ids in depth-first order from the root.
    pub fn ids(&self) -> Vec<PrimitiveId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        out
    }

    /// Materialized children of a primitive.
    pub fn children_of(&self, id: PrimitiveId) -> &[PrimitiveId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The selection history, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Number of undone selections available to redo.
    pub fn redo_depth(&self) -> usize {
        self.undone.len()
    }

    /// Unresolved primitives in depth-first order.
    pub fn pending(&self) -> Vec<&ChoicePrimitive> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .filter(|p| !p.is_resolved())
            .collect()
    }

    /// Ids from the root down to `id`, following parent back-links.
    pub fn path_to(&self, id: PrimitiveId) -> Result<Vec<PrimitiveId>> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self
                .nodes
                .get(&current)
                .ok_or(SpiralError::UnknownPrimitive { primitive_id: current })?;
            path.push(current);
            cursor = node.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Select an option on a primitive of this tree.
    ///
    /// Re-selecting the option already chosen succeeds with `changed == false`
    /// and leaves history untouched.
    pub fn select(
        &mut self,
        id: PrimitiveId,
        option: &str,
        expansion: &dyn Expansion,
    ) -> Result<SelectionOutcome> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(SpiralError::UnknownPrimitive { primitive_id: id })?;

        if !node.has_option(option) {
            return Err(SpiralError::InvalidOption {
                primitive_id: id,
                option: option.to_string(),
            });
        }

        if let Some(selected) = node.selected() {
            if selected == option {
                return Ok(SelectionOutcome {
                    tree_id: self.id,
                    primitive_id: id,
                    option: option.to_string(),
                    spawned: self.children_of(id).to_vec(),
                    changed: false,
                });
            }
            return Err(SpiralError::AlreadyResolved {
                primitive_id: id,
                selected: selected.to_string(),
                requested: option.to_string(),
            });
        }

        let outcome = self.apply(id, option, expansion)?;
        self.undone.clear();
        Ok(outcome)
    }

    /// Materialize the children of a resolved primitive (lazy trees).
    ///
    /// Returns the child ids; a no-op for unresolved or already expanded nodes.
    pub fn materialize(&mut self, id: PrimitiveId, expansion: &dyn Expansion) -> Result<Vec<PrimitiveId>> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(SpiralError::UnknownPrimitive { primitive_id: id })?;

        let Some(selected) = node.selected().map(str::to_string) else {
            return Ok(Vec::new());
        };

        if self.expanded.contains(&id) {
            return Ok(self.children_of(id).to_vec());
        }

        let specs = self.child_specs(id, &selected, expansion)?;
        let spawned = self.spawn(id, specs);
        self.expanded.insert(id);
        debug!("Materialized {} children for primitive {}", spawned.len(), id);
        Ok(spawned)
    }

    /// Revert the most recent selection.
    pub fn undo(&mut self) -> Result<UndoOutcome> {
        let entry = self
            .history
            .pop()
            .ok_or(SpiralError::NothingToUndo { tree_id: self.id })?;

        let removed = self.remove_descendants(entry.node_id);
        self.expanded.remove(&entry.node_id);
        if let Some(node) = self.nodes.get_mut(&entry.node_id) {
            node.state = entry.prior.clone();
        }

        debug!(
            "Undid selection on primitive {} ({} descendants removed)",
            entry.node_id,
            removed.len()
        );

        let outcome = UndoOutcome {
            tree_id: self.id,
            primitive_id: entry.node_id,
            prior: entry.prior.clone(),
            undone: entry.new.clone(),
            removed,
        };
        self.undone.push(entry);
        Ok(outcome)
    }

    /// Re-apply the most recently undone selection.
    pub fn redo(&mut self, expansion: &dyn Expansion) -> Result<SelectionOutcome> {
        let entry = self
            .undone
            .last()
            .cloned()
            .ok_or(SpiralError::NothingToRedo { tree_id: self.id })?;

        let option = entry
            .new
            .selected()
            .ok_or_else(|| SpiralError::Internal("undone entry without a selection".to_string()))?
            .to_string();

        let outcome = self.apply(entry.node_id, &option, expansion)?;
        self.undone.pop();
        Ok(outcome)
    }

    /// Undo every selection and drop the redo stack.
    pub fn reset(&mut self) -> Vec<PrimitiveId> {
        let mut removed = Vec::new();
        while let Ok(outcome) = self.undo() {
            removed.extend(outcome.removed);
        }
        self.undone.clear();
        removed
    }

    /// Check structural invariants: single root, one parent per node, no cycles.
    pub fn verify(&self) -> Result<()> {
        let root = self
            .nodes
            .get(&self.root)
            .ok_or_else(|| SpiralError::SnapshotCorrupt("root primitive missing".to_string()))?;
        if root.parent.is_some() {
            return Err(SpiralError::SnapshotCorrupt("root has a parent".to_string()));
        }

        let mut seen = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(SpiralError::SnapshotCorrupt(format!(
                    "primitive {} reachable twice",
                    id
                )));
            }
            for child in self.children_of(id) {
                let node = self.nodes.get(child).ok_or_else(|| {
                    SpiralError::SnapshotCorrupt(format!("child {} missing", child))
                })?;
                if node.parent != Some(id) {
                    return Err(SpiralError::SnapshotCorrupt(format!(
                        "child {} does not link back to {}",
                        child, id
                    )));
                }
                stack.push(*child);
            }
        }

        if seen.len() != self.nodes.len() {
            return Err(SpiralError::SnapshotCorrupt(
                "unreachable primitives present".to_string(),
            ));
        }

        if self.nodes.values().any(|n| n.tree_id != self.id) {
            return Err(SpiralError::SnapshotCorrupt(
                "primitive owned by another tree".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply a selection to an unresolved node, expanding eagerly if configured.
    fn apply(
        &mut self,
        id: PrimitiveId,
        option: &str,
        expansion: &dyn Expansion,
    ) -> Result<SelectionOutcome> {
        let prior = self
            .nodes
            .get(&id)
            .map(|n| n.state.clone())
            .ok_or(SpiralError::UnknownPrimitive { primitive_id: id })?;

        // Validate children before touching state so a bad expansion has no effect.
        let specs = match self.config.policy {
            ResolutionPolicy::Eager => Some(self.child_specs(id, option, expansion)?),
            ResolutionPolicy::Lazy => None,
        };

        let new_state = NodeState::Resolved(option.to_string());
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = new_state.clone();
        }

        let spawned = match specs {
            Some(specs) => {
                let spawned = self.spawn(id, specs);
                self.expanded.insert(id);
                spawned
            }
            None => Vec::new(),
        };

        self.history.push(HistoryEntry {
            tree_id: self.id,
            node_id: id,
            prior,
            new: new_state,
            spawned: spawned.clone(),
            timestamp: Utc::now(),
        });

        debug!(
            "Selected '{}' on primitive {} ({} children spawned)",
            option,
            id,
            spawned.len()
        );

        Ok(SelectionOutcome {
            tree_id: self.id,
            primitive_id: id,
            option: option.to_string(),
            spawned,
            changed: true,
        })
    }

    /// Run the expansion and validate every child option set.
    fn child_specs(
        &self,
        id: PrimitiveId,
        option: &str,
        expansion: &dyn Expansion,
    ) -> Result<Vec<Vec<OptionId>>> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(SpiralError::UnknownPrimitive { primitive_id: id })?;

        if !self.config.allows_expansion(node.depth) {
            return Ok(Vec::new());
        }

        let specs = expansion.expand(option, &node.context);
        for spec in &specs {
            validate_options(spec)?;
        }
        Ok(specs)
    }

    fn spawn(&mut self, parent_id: PrimitiveId, specs: Vec<Vec<OptionId>>) -> Vec<PrimitiveId> {
        let Some(parent) = self.nodes.get(&parent_id) else {
            return Vec::new();
        };
        let context = parent.context.clone();
        let depth = parent.depth + 1;

        let mut spawned = Vec::with_capacity(specs.len());
        for options in specs {
            // Option sets were validated by child_specs.
            if let Ok(child) =
                ChoicePrimitive::new(self.id, options, context.clone(), Some(parent_id), depth)
            {
                spawned.push(child.id);
                self.nodes.insert(child.id, child);
            }
        }

        self.children
            .entry(parent_id)
            .or_default()
            .extend(spawned.iter().copied());
        spawned
    }

    fn remove_descendants(&mut self, id: PrimitiveId) -> Vec<PrimitiveId> {
        let mut removed = Vec::new();
        let mut stack = self.children.remove(&id).unwrap_or_default();
        while let Some(child) = stack.pop() {
            if let Some(grandchildren) = self.children.remove(&child) {
                stack.extend(grandchildren);
            }
            self.nodes.remove(&child);
            self.expanded.remove(&child);
            removed.push(child);
        }
        removed
    }
}
