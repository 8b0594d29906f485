//! The Spiral Kernel: registry, lock boundary and history owner for all trees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spiral_core::{
    ChoicePrimitive, ChoiceTree, Context, Expansion, HistoryEntry, NoExpansion, OptionId,
    PrimitiveId, Result, SelectionOutcome, SpiralError, TreeConfig, TreeId, UndoOutcome,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::events::{EventFilter, KernelEvent, KernelEventKind, KernelSubscription};
use crate::snapshot::Snapshot;

/// One tree plus the expansion function bound to it.
struct TreeSlot {
    tree: RwLock<ChoiceTree>,
    expansion: Arc<dyn Expansion>,
    /// Set when a restore replaced this slot; holders must look it up again.
    retired: AtomicBool,
}

impl TreeSlot {
    fn new(tree: ChoiceTree, expansion: Arc<dyn Expansion>) -> Arc<Self> {
        Arc::new(Self {
            tree: RwLock::new(tree),
            expansion,
            retired: AtomicBool::new(false),
        })
    }
}

/// Authoritative owner of every choice tree.
///
/// Locking is per tree: a selection takes that tree's write lock, which makes
/// the unresolved-to-resolved transition a compare-and-set, while selections
/// and checkpoints on other trees proceed independently. Lock order is
/// tree slot, then primitive index, then tree table.
pub struct SpiralKernel {
    /// Tree table: tree_id -> slot.
    trees: RwLock<HashMap<TreeId, Arc<TreeSlot>>>,

    /// Primitive index: primitive_id -> owning tree.
    index: RwLock<HashMap<PrimitiveId, TreeId>>,

    /// Expansion used when a tree is created or restored without one.
    default_expansion: Arc<dyn Expansion>,

    /// Event feed.
    events: broadcast::Sender<KernelEvent>,
}

impl SpiralKernel {
    /// Create a kernel whose trees never spawn children unless given an expansion.
    pub fn new() -> Self {
        Self::with_expansion(Arc::new(NoExpansion))
    }

    /// Create a kernel with a default expansion function.
    pub fn with_expansion(expansion: Arc<dyn Expansion>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            trees: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            default_expansion: expansion,
            events,
        }
    }

    /// Subscribe to all kernel events.
    pub fn subscribe(&self) -> KernelSubscription {
        self.subscribe_filtered(EventFilter::default())
    }

    /// Subscribe to kernel events matching a filter.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> KernelSubscription {
        KernelSubscription::new(filter, self.events.subscribe())
    }

    /// Create a standalone primitive as the root of a new eager tree.
    pub async fn create(&self, options: Vec<OptionId>, context: Context) -> Result<PrimitiveId> {
        let (_, root) = self
            .create_tree(options, context, TreeConfig::default())
            .await?;
        Ok(root)
    }

    /// Create a new tree using the kernel's default expansion.
    pub async fn create_tree(
        &self,
        options: Vec<OptionId>,
        context: Context,
        config: TreeConfig,
    ) -> Result<(TreeId, PrimitiveId)> {
        self.create_tree_with(options, context, config, self.default_expansion.clone())
            .await
    }

    /// Create a new tree bound to a specific expansion function.
    pub async fn create_tree_with(
        &self,
        options: Vec<OptionId>,
        context: Context,
        config: TreeConfig,
        expansion: Arc<dyn Expansion>,
    ) -> Result<(TreeId, PrimitiveId)> {
        let tree = ChoiceTree::new(options, context, config)?;
        let tree_id = tree.id;
        let root = tree.root;

        self.index.write().await.insert(root, tree_id);
        self.trees
            .write()
            .await
            .insert(tree_id, TreeSlot::new(tree, expansion));

        debug!("Created tree {} with root {} ({:?})", tree_id, root, config.policy);
        self.emit(KernelEvent::new(KernelEventKind::Created, tree_id).primitive(root));

        Ok((tree_id, root))
    }

    /// Select an option on a primitive.
    ///
    /// Exactly one of several racing callers with different options succeeds;
    /// the rest receive `AlreadyResolved`. Re-selecting the chosen option is
    /// idempotent and records nothing.
    pub async fn select(&self, primitive_id: PrimitiveId, option: &str) -> Result<SelectionOutcome> {
        loop {
            let slot = self.slot_for_primitive(primitive_id).await?;
            let mut tree = slot.tree.write().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }

            let outcome = tree.select(primitive_id, option, slot.expansion.as_ref())?;
            if !outcome.changed {
                return Ok(outcome);
            }

            if !outcome.spawned.is_empty() {
                let mut index = self.index.write().await;
                for child in &outcome.spawned {
                    index.insert(*child, outcome.tree_id);
                }
            }
            drop(tree);

            self.emit(
                KernelEvent::new(KernelEventKind::Selected, outcome.tree_id)
                    .primitive(primitive_id)
                    .option(outcome.option.clone())
                    .affected(outcome.spawned.clone()),
            );
            return Ok(outcome);
        }
    }

    /// Revert the most recent selection of a tree.
    pub async fn undo(&self, tree_id: TreeId) -> Result<UndoOutcome> {
        loop {
            let slot = self.slot(tree_id).await?;
            let mut tree = slot.tree.write().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }

            let outcome = tree.undo()?;
            self.unindex(&outcome.removed).await;
            drop(tree);

            self.emit(
                KernelEvent::new(KernelEventKind::Undone, tree_id)
                    .primitive(outcome.primitive_id)
                    .affected(outcome.removed.clone()),
            );
            return Ok(outcome);
        }
    }

    /// Re-apply the most recently undone selection of a tree.
    pub async fn redo(&self, tree_id: TreeId) -> Result<SelectionOutcome> {
        loop {
            let slot = self.slot(tree_id).await?;
            let mut tree = slot.tree.write().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }

            let outcome = tree.redo(slot.expansion.as_ref())?;
            if !outcome.spawned.is_empty() {
                let mut index = self.index.write().await;
                for child in &outcome.spawned {
                    index.insert(*child, tree_id);
                }
            }
            drop(tree);

            self.emit(
                KernelEvent::new(KernelEventKind::Redone, tree_id)
                    .primitive(outcome.primitive_id)
                    .option(outcome.option.clone())
                    .affected(outcome.spawned.clone()),
            );
            return Ok(outcome);
        }
    }

    /// Revert a tree to its bare, unresolved root.
    pub async fn reset(&self, tree_id: TreeId) -> Result<Vec<PrimitiveId>> {
        loop {
            let slot = self.slot(tree_id).await?;
            let mut tree = slot.tree.write().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }

            let removed = tree.reset();
            let root = tree.root;
            self.unindex(&removed).await;
            drop(tree);

            self.emit(
                KernelEvent::new(KernelEventKind::Reset, tree_id)
                    .primitive(root)
                    .affected(removed.clone()),
            );
            return Ok(removed);
        }
    }

    /// Get a copy of a primitive.
    pub async fn get(&self, primitive_id: PrimitiveId) -> Result<ChoicePrimitive> {
        let slot = self.slot_for_primitive(primitive_id).await?;
        let tree = slot.tree.read().await;
        tree.get(primitive_id)
            .cloned()
            .ok_or(SpiralError::UnknownPrimitive { primitive_id })
    }

    /// Children of a primitive, materializing them first under lazy resolution.
    pub async fn children(&self, primitive_id: PrimitiveId) -> Result<Vec<ChoicePrimitive>> {
        loop {
            let slot = self.slot_for_primitive(primitive_id).await?;
            let mut tree = slot.tree.write().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }

            let before = tree.children_of(primitive_id).len();
            let ids = tree.materialize(primitive_id, slot.expansion.as_ref())?;
            let tree_id = tree.id;

            if ids.len() > before {
                let fresh: Vec<PrimitiveId> = ids[before..].to_vec();
                {
                    let mut index = self.index.write().await;
                    for child in &fresh {
                        index.insert(*child, tree_id);
                    }
                }
                self.emit(
                    KernelEvent::new(KernelEventKind::Expanded, tree_id)
                        .primitive(primitive_id)
                        .affected(fresh),
                );
            }

            return Ok(ids
                .iter()
                .filter_map(|id| tree.get(*id).cloned())
                .collect());
        }
    }

    /// The tree owning a primitive.
    pub async fn tree_of(&self, primitive_id: PrimitiveId) -> Result<TreeId> {
        self.index
            .read()
            .await
            .get(&primitive_id)
            .copied()
            .ok_or(SpiralError::UnknownPrimitive { primitive_id })
    }

    /// Selection history of a tree, oldest first.
    pub async fn history(&self, tree_id: TreeId) -> Result<Vec<HistoryEntry>> {
        let slot = self.slot(tree_id).await?;
        let tree = slot.tree.read().await;
        Ok(tree.history().to_vec())
    }

    /// Unresolved primitives of a tree.
    pub async fn pending(&self, tree_id: TreeId) -> Result<Vec<ChoicePrimitive>> {
        let slot = self.slot(tree_id).await?;
        let tree = slot.tree.read().await;
        Ok(tree.pending().into_iter().cloned().collect())
    }

    /// A full copy of a tree.
    pub async fn tree(&self, tree_id: TreeId) -> Result<ChoiceTree> {
        let slot = self.slot(tree_id).await?;
        let tree = slot.tree.read().await;
        Ok(tree.clone())
    }

    /// Ids of all live trees.
    pub async fn tree_ids(&self) -> Vec<TreeId> {
        self.trees.read().await.keys().copied().collect()
    }

    /// Capture a tree for the persistence collaborator.
    ///
    /// Holds the tree's read lock for the capture, so the snapshot never sees a
    /// half-applied selection and other trees are not blocked.
    pub async fn checkpoint(&self, tree_id: TreeId) -> Result<Snapshot> {
        let slot = self.slot(tree_id).await?;
        let tree = slot.tree.read().await;
        let snapshot = Snapshot::capture(&tree)?;
        debug!(
            "Checkpointed tree {} at version {} ({} bytes)",
            tree_id,
            snapshot.version,
            snapshot.len()
        );
        Ok(snapshot)
    }

    /// Restore a tree from a snapshot, replacing any live tree with the same id.
    pub async fn restore(&self, snapshot: Snapshot) -> Result<TreeId> {
        let expansion = match self.trees.read().await.get(&snapshot.tree_id) {
            Some(slot) => slot.expansion.clone(),
            None => self.default_expansion.clone(),
        };
        self.restore_with(snapshot, expansion).await
    }

    /// Restore a tree from a snapshot and bind it to an expansion function.
    pub async fn restore_with(
        &self,
        snapshot: Snapshot,
        expansion: Arc<dyn Expansion>,
    ) -> Result<TreeId> {
        let tree = snapshot.decode()?;
        let tree_id = tree.id;
        let ids = tree.ids();

        let previous = self.trees.read().await.get(&tree_id).cloned();
        let old_guard = match previous.as_ref() {
            Some(slot) => Some(slot.tree.write().await),
            None => None,
        };

        {
            let mut index = self.index.write().await;
            if let Some(old) = old_guard.as_ref() {
                for id in old.ids() {
                    index.remove(&id);
                }
            }
            for id in &ids {
                index.insert(*id, tree_id);
            }
        }

        self.trees
            .write()
            .await
            .insert(tree_id, TreeSlot::new(tree, expansion));

        if let Some(slot) = previous.as_ref() {
            slot.retired.store(true, Ordering::Release);
        }
        drop(old_guard);

        info!(
            "Restored tree {} from snapshot {} (version {})",
            tree_id, snapshot.id, snapshot.version
        );
        self.emit(KernelEvent::new(KernelEventKind::Restored, tree_id).affected(ids));

        Ok(tree_id)
    }

    async fn slot(&self, tree_id: TreeId) -> Result<Arc<TreeSlot>> {
        self.trees
            .read()
            .await
            .get(&tree_id)
            .cloned()
            .ok_or(SpiralError::UnknownTree { tree_id })
    }

    async fn slot_for_primitive(&self, primitive_id: PrimitiveId) -> Result<Arc<TreeSlot>> {
        let tree_id = self.tree_of(primitive_id).await?;
        self.slot(tree_id)
            .await
            .map_err(|_| SpiralError::UnknownPrimitive { primitive_id })
    }

    async fn unindex(&self, ids: &[PrimitiveId]) {
        if ids.is_empty() {
            return;
        }
        let mut index = self.index.write().await;
        for id in ids {
            index.remove(id);
        }
    }

    fn emit(&self, event: KernelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for SpiralKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_core::NodeState;

    fn opts(labels: &[&str]) -> Vec<OptionId> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    fn spawn_pair(selected: &str, _ctx: &Context) -> Vec<Vec<OptionId>> {
        vec![
            vec![format!("{}1", selected), format!("{}2", selected)],
            vec![format!("{}3", selected)],
        ]
    }

    fn kernel() -> SpiralKernel {
        SpiralKernel::with_expansion(Arc::new(spawn_pair))
    }

    #[tokio::test]
    async fn test_create_and_select() {
        let kernel = kernel();
        let p = kernel.create(opts(&["A", "B", "C"]), Context::new()).await.unwrap();

        let outcome = kernel.select(p, "B").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.spawned.len(), 2);

        let child = kernel.get(outcome.spawned[0]).await.unwrap();
        assert_eq!(child.parent, Some(p));
        assert_eq!(kernel.tree_of(child.id).await.unwrap(), outcome.tree_id);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_options() {
        let kernel = kernel();
        assert_eq!(
            kernel.create(vec![], Context::new()).await.unwrap_err(),
            SpiralError::EmptyOptionSet
        );
        assert!(matches!(
            kernel.create(opts(&["A", "A"]), Context::new()).await,
            Err(SpiralError::DuplicateOption { .. })
        ));
        assert!(kernel.tree_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_reselect() {
        let kernel = kernel();
        let p = kernel.create(opts(&["A", "B"]), Context::new()).await.unwrap();
        let tree_id = kernel.tree_of(p).await.unwrap();

        kernel.select(p, "A").await.unwrap();
        let again = kernel.select(p, "A").await.unwrap();
        assert!(!again.changed);
        assert_eq!(kernel.history(tree_id).await.unwrap().len(), 1);

        let err = kernel.select(p, "B").await.unwrap_err();
        assert!(matches!(err, SpiralError::AlreadyResolved { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_select_single_winner() {
        let kernel = Arc::new(kernel());
        let p = kernel
            .create(opts(&["A", "B", "C", "D"]), Context::new())
            .await
            .unwrap();

        let tasks = ["A", "B", "C", "D"].map(|option| {
            let kernel = kernel.clone();
            tokio::spawn(async move { kernel.select(p, option).await })
        });
        let results = futures::future::join_all(tasks).await;

        let winners = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(o)) if o.changed))
            .count();
        let losers = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(SpiralError::AlreadyResolved { .. }))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, 3);

        let tree_id = kernel.tree_of(p).await.unwrap();
        assert_eq!(kernel.history(tree_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undo_unindexes_children() {
        let kernel = kernel();
        let p = kernel.create(opts(&["A"]), Context::new()).await.unwrap();
        let tree_id = kernel.tree_of(p).await.unwrap();

        let outcome = kernel.select(p, "A").await.unwrap();
        let undo = kernel.undo(tree_id).await.unwrap();

        assert_eq!(undo.prior, NodeState::Unresolved);
        for child in outcome.spawned {
            assert!(matches!(
                kernel.get(child).await,
                Err(SpiralError::UnknownPrimitive { .. })
            ));
        }
        assert!(!kernel.get(p).await.unwrap().is_resolved());
        assert!(matches!(
            kernel.undo(tree_id).await,
            Err(SpiralError::NothingToUndo { .. })
        ));
    }

    #[tokio::test]
    async fn test_lazy_tree_children_on_access() {
        let kernel = kernel();
        let (tree_id, root) = kernel
            .create_tree(opts(&["A", "B"]), Context::new(), TreeConfig::lazy())
            .await
            .unwrap();

        let outcome = kernel.select(root, "A").await.unwrap();
        assert!(outcome.spawned.is_empty());

        let children = kernel.children(root).await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(kernel.tree_of(children[0].id).await.unwrap(), tree_id);

        let again = kernel.children(root).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].id, children[0].id);
    }

    #[tokio::test]
    async fn test_children_follow_a_concurrent_restore() {
        let kernel = Arc::new(kernel());
        let (tree_id, root) = kernel
            .create_tree(opts(&["A", "B"]), Context::new(), TreeConfig::lazy())
            .await
            .unwrap();
        kernel.select(root, "A").await.unwrap();
        let snapshot = kernel.checkpoint(tree_id).await.unwrap();

        // Hold the live tree so the restore and the lookup queue up behind us.
        let slot = kernel.slot(tree_id).await.unwrap();
        let guard = slot.tree.write().await;

        let restoring = tokio::spawn({
            let kernel = kernel.clone();
            async move { kernel.restore(snapshot).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let listing = tokio::spawn({
            let kernel = kernel.clone();
            async move { kernel.children(root).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        drop(guard);
        restoring.await.unwrap().unwrap();
        let children = listing.await.unwrap().unwrap();

        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(kernel.get(child.id).await.unwrap().id, child.id);
        }
        assert_eq!(kernel.tree(tree_id).await.unwrap().children_of(root).len(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let kernel = kernel();
        let p = kernel.create(opts(&["A", "B"]), Context::new()).await.unwrap();
        let tree_id = kernel.tree_of(p).await.unwrap();

        let snapshot = kernel.checkpoint(tree_id).await.unwrap();
        let outcome = kernel.select(p, "A").await.unwrap();

        let restored = kernel.restore(snapshot).await.unwrap();
        assert_eq!(restored, tree_id);
        assert!(!kernel.get(p).await.unwrap().is_resolved());
        assert!(kernel.history(tree_id).await.unwrap().is_empty());
        for child in outcome.spawned {
            assert!(kernel.tree_of(child).await.is_err());
        }

        // The restored tree is live and selectable again.
        kernel.select(p, "B").await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_into_fresh_kernel() {
        let source = kernel();
        let p = source.create(opts(&["A"]), Context::new()).await.unwrap();
        let tree_id = source.tree_of(p).await.unwrap();
        source.select(p, "A").await.unwrap();
        let snapshot = source.checkpoint(tree_id).await.unwrap();

        let target = kernel();
        target.restore(snapshot).await.unwrap();
        assert_eq!(target.history(tree_id).await.unwrap().len(), 1);
        assert_eq!(target.tree(tree_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let kernel = kernel();
        let mut sub = kernel.subscribe_filtered(
            EventFilter::default().kinds(vec![KernelEventKind::Selected, KernelEventKind::Undone]),
        );

        let p = kernel.create(opts(&["A"]), Context::new()).await.unwrap();
        let tree_id = kernel.tree_of(p).await.unwrap();
        kernel.select(p, "A").await.unwrap();
        kernel.undo(tree_id).await.unwrap();

        let selected = sub.next().await.unwrap();
        assert_eq!(selected.kind, KernelEventKind::Selected);
        assert_eq!(selected.option.as_deref(), Some("A"));
        assert_eq!(selected.affected.len(), 2);

        let undone = sub.next().await.unwrap();
        assert_eq!(undone.kind, KernelEventKind::Undone);
        assert_eq!(undone.affected.len(), 2);
    }

    #[tokio::test]
    async fn test_redo_and_reset() {
        let kernel = kernel();
        let p = kernel.create(opts(&["A"]), Context::new()).await.unwrap();
        let tree_id = kernel.tree_of(p).await.unwrap();

        kernel.select(p, "A").await.unwrap();
        kernel.undo(tree_id).await.unwrap();
        let redone = kernel.redo(tree_id).await.unwrap();
        assert_eq!(redone.spawned.len(), 2);
        assert!(kernel.get(redone.spawned[0]).await.is_ok());

        let removed = kernel.reset(tree_id).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(kernel.pending(tree_id).await.unwrap().len(), 1);
    }
}
