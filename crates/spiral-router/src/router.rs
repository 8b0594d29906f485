//! The choice router: pending table, proposal bookkeeping and deadlines.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use spiral_core::context::{matches_subset, project};
use spiral_core::{
    AgentId, Context, OptionId, PrimitiveId, Resolution, Result, SpiralError, TreeId,
};
use spiral_kernel::SpiralKernel;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::intent::Intent;

/// Configuration for the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Deadline applied to intents that do not carry one (milliseconds).
    pub default_deadline_ms: Option<u64>,

    /// Resolved routes remembered so an undo can reopen them with their
    /// original requesters, deadline and default. Oldest are forgotten first.
    pub settled_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: None,
            settled_capacity: 4096,
        }
    }
}

/// A proposed option for a pending primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// The proposing agent.
    pub agent_id: AgentId,

    /// The proposed option.
    pub option: OptionId,

    /// The intent carrying the proposal.
    pub intent_id: Uuid,

    /// When the proposal was received.
    pub proposed_at: DateTime<Utc>,
}

/// A routed primitive that has not been resolved yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRoute {
    /// The routed primitive.
    pub primitive_id: PrimitiveId,

    /// Its tree.
    pub tree_id: TreeId,

    /// The primitive's options, in declared order.
    pub options: Vec<OptionId>,

    /// Context pairs an intent must match to attach (empty: attach by id only).
    pub match_context: Context,

    /// The declared matching subset this route belongs to. Spawned children
    /// inherit their parent's, so they share its topic.
    pub scope: Context,

    /// When the route expires.
    pub deadline_at: Option<DateTime<Utc>>,

    /// Option applied at expiry.
    pub default_option: Option<OptionId>,

    /// Everyone waiting on the outcome, in arrival order.
    pub requesters: Vec<AgentId>,

    /// Competing proposals, in arrival order.
    pub proposals: Vec<Proposal>,

    /// When the route was opened.
    pub opened_at: DateTime<Utc>,
}

impl PendingRoute {
    /// Number of distinct options proposed.
    pub fn distinct_options(&self) -> usize {
        let mut seen: Vec<&str> = Vec::new();
        for p in &self.proposals {
            if !seen.contains(&p.option.as_str()) {
                seen.push(&p.option);
            }
        }
        seen.len()
    }

    /// Check if the route has expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline_at.map_or(false, |d| now >= d)
    }

    fn outcome(&self, attached: bool) -> RouteOutcome {
        RouteOutcome {
            primitive_id: self.primitive_id,
            tree_id: self.tree_id,
            attached,
            proposals: self.proposals.clone(),
            deadline_at: self.deadline_at,
        }
    }
}

/// Result of routing one intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteOutcome {
    /// The primitive the intent was routed to.
    pub primitive_id: PrimitiveId,

    /// Its tree.
    pub tree_id: TreeId,

    /// True if the intent joined an existing pending primitive.
    pub attached: bool,

    /// All proposals now recorded for the primitive.
    pub proposals: Vec<Proposal>,

    /// When the route expires.
    pub deadline_at: Option<DateTime<Utc>>,
}

impl RouteOutcome {
    /// Check if proposals for different options are competing.
    pub fn is_contested(&self) -> bool {
        self.proposals
            .iter()
            .any(|p| p.option != self.proposals[0].option)
    }
}

/// A route that hit its deadline.
#[derive(Debug, Clone)]
pub struct Expired {
    /// The route as it was when it expired.
    pub route: PendingRoute,

    /// The timeout outcome delivered to waiters.
    pub resolution: Resolution,
}

#[derive(Default)]
struct PendingTable {
    /// Insertion order, so the oldest matching route wins.
    order: Vec<PrimitiveId>,
    routes: HashMap<PrimitiveId, PendingRoute>,
    waiters: HashMap<PrimitiveId, watch::Sender<Option<Resolution>>>,

    /// Routes released by a resolution or expiry, oldest first.
    settled: HashMap<PrimitiveId, PendingRoute>,
    settled_order: VecDeque<PrimitiveId>,
}

impl PendingTable {
    fn find_match(&self, ctx: &Context) -> Option<PrimitiveId> {
        self.order
            .iter()
            .find(|id| {
                self.routes
                    .get(id)
                    .map_or(false, |r| matches_subset(&r.match_context, ctx))
            })
            .copied()
    }

    fn insert(&mut self, route: PendingRoute) {
        let id = route.primitive_id;
        let (tx, _) = watch::channel(None);
        self.order.push(id);
        self.waiters.insert(id, tx);
        self.routes.insert(id, route);
    }

    fn remove(
        &mut self,
        id: PrimitiveId,
    ) -> Option<(PendingRoute, Option<watch::Sender<Option<Resolution>>>)> {
        let route = self.routes.remove(&id)?;
        self.order.retain(|p| *p != id);
        Some((route, self.waiters.remove(&id)))
    }

    fn settle(&mut self, route: PendingRoute, capacity: usize) {
        if capacity == 0 {
            return;
        }
        let id = route.primitive_id;
        if self.settled.insert(id, route).is_none() {
            self.settled_order.push_back(id);
        }
        while self.settled_order.len() > capacity {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }

    fn unsettle(&mut self, id: PrimitiveId) -> Option<PendingRoute> {
        let route = self.settled.remove(&id)?;
        self.settled_order.retain(|p| *p != id);
        Some(route)
    }
}

/// Routes intents to pending primitives.
///
/// The table lock is never held across a kernel call, so a slow expansion
/// only delays the route it belongs to.
pub struct ChoiceRouter {
    kernel: Arc<SpiralKernel>,
    config: RouterConfig,
    table: Mutex<PendingTable>,
    /// Serializes route creation so two matching intents never open two routes.
    creating: Mutex<()>,
}

impl ChoiceRouter {
    /// Create a new router over a kernel.
    pub fn new(kernel: Arc<SpiralKernel>, config: RouterConfig) -> Self {
        Self {
            kernel,
            config,
            table: Mutex::new(PendingTable::default()),
            creating: Mutex::new(()),
        }
    }

    /// The kernel this router creates primitives in.
    pub fn kernel(&self) -> &Arc<SpiralKernel> {
        &self.kernel
    }

    /// Route an intent to a pending primitive, creating one if nothing matches.
    ///
    /// An intent that matches an existing route is attached to it and its
    /// proposal is recorded next to the others; competing proposals are never
    /// merged here.
    pub async fn route(&self, intent: Intent) -> Result<RouteOutcome> {
        if let Some(outcome) = self.attach(&intent).await? {
            return Ok(outcome);
        }

        let _creating = self.creating.lock().await;
        // A matching route may have been opened while we waited.
        if let Some(outcome) = self.attach(&intent).await? {
            return Ok(outcome);
        }

        let (tree_id, primitive_id) = self
            .kernel
            .create_tree(
                intent.options.clone(),
                intent.context.clone(),
                intent.tree_config,
            )
            .await?;

        let now = Utc::now();
        let deadline = intent.deadline.or_else(|| self.default_deadline());
        let proposals: Vec<Proposal> = intent
            .proposal
            .map(|option| Proposal {
                agent_id: intent.requester.clone(),
                option,
                intent_id: intent.id,
                proposed_at: now,
            })
            .into_iter()
            .collect();
        let match_context = project(&intent.context, &intent.match_keys);

        let route = PendingRoute {
            primitive_id,
            tree_id,
            options: intent.options,
            scope: match_context.clone(),
            match_context,
            deadline_at: deadline.map(|d| now + d),
            default_option: intent.default_option,
            requesters: vec![intent.requester],
            proposals,
            opened_at: now,
        };
        let outcome = route.outcome(false);
        self.table.lock().await.insert(route);

        debug!("Routed intent {} to new primitive {}", intent.id, primitive_id);
        Ok(outcome)
    }

    /// Attach an intent to the oldest matching route, if any.
    async fn attach(&self, intent: &Intent) -> Result<Option<RouteOutcome>> {
        let mut table = self.table.lock().await;
        let Some(primitive_id) = table.find_match(&intent.context) else {
            return Ok(None);
        };
        let route = table
            .routes
            .get_mut(&primitive_id)
            .ok_or_else(|| SpiralError::Internal("matched route vanished".to_string()))?;

        if let Some(option) = intent.proposal.as_ref() {
            if !route.options.contains(option) {
                return Err(SpiralError::InvalidOption {
                    primitive_id,
                    option: option.clone(),
                });
            }
        }

        if !route.requesters.contains(&intent.requester) {
            route.requesters.push(intent.requester.clone());
        }
        if let Some(option) = intent.proposal.clone() {
            route.proposals.push(Proposal {
                agent_id: intent.requester.clone(),
                option,
                intent_id: intent.id,
                proposed_at: Utc::now(),
            });
        }

        debug!(
            "Attached intent {} to pending primitive {} ({} proposals)",
            intent.id,
            primitive_id,
            route.proposals.len()
        );
        Ok(Some(route.outcome(true)))
    }

    fn default_deadline(&self) -> Option<Duration> {
        self.config
            .default_deadline_ms
            .map(|ms| Duration::milliseconds(ms as i64))
    }

    /// Track an existing primitive (e.g. a spawned child) as pending, addressable by id only.
    ///
    /// `scope` is the matching subset the primitive's topic derives from.
    pub async fn track(
        &self,
        primitive_id: PrimitiveId,
        requesters: Vec<AgentId>,
        scope: Context,
    ) -> Result<()> {
        let primitive = self.kernel.get(primitive_id).await?;
        let mut table = self.table.lock().await;
        if table.routes.contains_key(&primitive_id) {
            return Ok(());
        }

        let now = Utc::now();
        table.insert(PendingRoute {
            primitive_id,
            tree_id: primitive.tree_id,
            options: primitive.options,
            match_context: Context::new(),
            scope,
            deadline_at: self.default_deadline().map(|d| now + d),
            default_option: None,
            requesters,
            proposals: Vec::new(),
            opened_at: now,
        });
        Ok(())
    }

    /// Make a primitive pending again after its selection was undone.
    ///
    /// A remembered route comes back with its requesters, match keys, default
    /// and the same deadline length, but without its old proposals. A
    /// primitive that was never routed is tracked by id only.
    pub async fn reopen(&self, primitive_id: PrimitiveId) -> Result<PendingRoute> {
        let primitive = self.kernel.get(primitive_id).await?;
        let mut table = self.table.lock().await;
        if let Some(route) = table.routes.get(&primitive_id) {
            return Ok(route.clone());
        }

        let now = Utc::now();
        let route = match table.unsettle(primitive_id) {
            Some(previous) => PendingRoute {
                deadline_at: previous
                    .deadline_at
                    .map(|d| now + (d - previous.opened_at)),
                proposals: Vec::new(),
                opened_at: now,
                ..previous
            },
            None => PendingRoute {
                primitive_id,
                tree_id: primitive.tree_id,
                options: primitive.options,
                match_context: Context::new(),
                scope: Context::new(),
                deadline_at: self.default_deadline().map(|d| now + d),
                default_option: None,
                requesters: Vec::new(),
                proposals: Vec::new(),
                opened_at: now,
            },
        };
        table.insert(route.clone());
        debug!("Reopened route for primitive {}", primitive_id);
        Ok(route)
    }

    /// Drop every trace of a primitive, waking waiters with a cancelled resolution.
    pub async fn forget(&self, primitive_id: PrimitiveId) -> Option<PendingRoute> {
        let mut table = self.table.lock().await;
        let settled = table.unsettle(primitive_id);
        match table.remove(primitive_id) {
            Some((route, waiter)) => {
                if let Some(tx) = waiter {
                    let _ = tx.send(Some(Resolution::cancelled(primitive_id)));
                }
                Some(route)
            }
            None => settled,
        }
    }

    /// Record a proposal for a tracked primitive by id.
    pub async fn propose(
        &self,
        primitive_id: PrimitiveId,
        agent_id: AgentId,
        option: OptionId,
    ) -> Result<Vec<Proposal>> {
        let mut table = self.table.lock().await;
        let route = table
            .routes
            .get_mut(&primitive_id)
            .ok_or(SpiralError::UnknownPrimitive { primitive_id })?;
        if !route.options.contains(&option) {
            return Err(SpiralError::InvalidOption {
                primitive_id,
                option,
            });
        }

        route.proposals.push(Proposal {
            agent_id,
            option,
            intent_id: Uuid::new_v4(),
            proposed_at: Utc::now(),
        });
        Ok(route.proposals.clone())
    }

    /// A copy of a pending route.
    pub async fn pending(&self, primitive_id: PrimitiveId) -> Option<PendingRoute> {
        self.table.lock().await.routes.get(&primitive_id).cloned()
    }

    /// Ids of all pending routes, oldest first.
    pub async fn pending_ids(&self) -> Vec<PrimitiveId> {
        self.table.lock().await.order.clone()
    }

    /// The matching subset of a pending or remembered route.
    pub async fn scope_of(&self, primitive_id: PrimitiveId) -> Option<Context> {
        let table = self.table.lock().await;
        table
            .routes
            .get(&primitive_id)
            .or_else(|| table.settled.get(&primitive_id))
            .map(|r| r.scope.clone())
    }

    /// Release a pending route after it was resolved and wake its waiters.
    pub async fn resolve(&self, resolution: Resolution) -> Option<PendingRoute> {
        let mut table = self.table.lock().await;
        let (route, waiter) = table.remove(resolution.primitive_id)?;
        table.settle(route.clone(), self.config.settled_capacity);
        drop(table);

        if let Some(tx) = waiter {
            let _ = tx.send(Some(resolution));
        }
        Some(route)
    }

    /// Wait for a pending route to be resolved.
    ///
    /// With a timeout, an elapsed wait returns `Timeout` and leaves the route
    /// pending; the deadline sweep decides its fate.
    pub async fn wait(
        &self,
        primitive_id: PrimitiveId,
        timeout: Option<std::time::Duration>,
    ) -> Result<Resolution> {
        let rx = self.watch(primitive_id).await?;
        match timeout {
            Some(limit) => Self::await_within(primitive_id, rx, limit).await,
            None => Self::await_resolution(rx).await,
        }
    }

    /// Route an intent and wait for its resolution until its deadline.
    ///
    /// At the deadline the timeout rule is applied here: the default option is
    /// selected if configured, otherwise the route ends unresolved.
    pub async fn route_and_wait(&self, intent: Intent) -> Result<Resolution> {
        let outcome = self.route(intent).await?;
        let rx = self.watch(outcome.primitive_id).await?;

        let Some(deadline_at) = outcome.deadline_at else {
            return Self::await_resolution(rx).await;
        };
        let limit = (deadline_at - Utc::now()).to_std().unwrap_or_default();

        match Self::await_within(outcome.primitive_id, rx.clone(), limit).await {
            Err(SpiralError::Timeout { .. }) => match self.expire(outcome.primitive_id).await {
                Some(expired) => Ok(expired.resolution),
                // Lost the race to a concurrent resolution or sweep.
                None => Self::await_resolution(rx).await,
            },
            other => other,
        }
    }

    async fn watch(&self, primitive_id: PrimitiveId) -> Result<watch::Receiver<Option<Resolution>>> {
        self.table
            .lock()
            .await
            .waiters
            .get(&primitive_id)
            .map(|tx| tx.subscribe())
            .ok_or(SpiralError::UnknownPrimitive { primitive_id })
    }

    async fn await_within(
        primitive_id: PrimitiveId,
        rx: watch::Receiver<Option<Resolution>>,
        limit: std::time::Duration,
    ) -> Result<Resolution> {
        tokio::time::timeout(limit, Self::await_resolution(rx))
            .await
            .map_err(|_| SpiralError::Timeout {
                duration_ms: limit.as_millis() as u64,
                message: format!("waiting for primitive {}", primitive_id),
            })?
    }

    async fn await_resolution(mut rx: watch::Receiver<Option<Resolution>>) -> Result<Resolution> {
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(resolution) = current {
                return Ok(resolution);
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.ok_or_else(|| {
                    SpiralError::Internal("route closed without resolution".to_string())
                });
            }
        }
    }

    /// Expire every route whose deadline has passed.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Vec<Expired> {
        let due: Vec<PrimitiveId> = {
            let table = self.table.lock().await;
            table
                .order
                .iter()
                .filter(|id| table.routes.get(id).map_or(false, |r| r.is_expired(now)))
                .copied()
                .collect()
        };

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            if let Some(e) = self.expire(id).await {
                expired.push(e);
            }
        }
        expired
    }

    /// Expire one route now, regardless of its deadline.
    pub async fn expire(&self, primitive_id: PrimitiveId) -> Option<Expired> {
        let (route, waiter) = {
            let mut table = self.table.lock().await;
            let (route, waiter) = table.remove(primitive_id)?;
            table.settle(route.clone(), self.config.settled_capacity);
            (route, waiter)
        };

        let resolution = match route.default_option.as_deref() {
            Some(default) => match self.kernel.select(primitive_id, default).await {
                Ok(outcome) => Resolution::timeout(primitive_id, Some(outcome.option), outcome.spawned),
                Err(SpiralError::AlreadyResolved { selected, .. }) => {
                    Resolution::selected(primitive_id, selected, Vec::new())
                }
                Err(e) => {
                    warn!("Default resolution of {} failed: {}", primitive_id, e);
                    Resolution::timeout(primitive_id, None, Vec::new())
                }
            },
            None => Resolution::timeout(primitive_id, None, Vec::new()),
        };

        warn!(
            "Route for primitive {} timed out (default applied: {:?})",
            primitive_id, resolution.selected
        );

        if let Some(tx) = waiter {
            let _ = tx.send(Some(resolution.clone()));
        }
        Some(Expired { route, resolution })
    }

    /// Cancel every pending route, waking waiters with a cancelled resolution.
    pub async fn cancel_all(&self) -> Vec<PendingRoute> {
        let mut table = self.table.lock().await;
        table.settled.clear();
        table.settled_order.clear();
        let ids = table.order.clone();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((route, waiter)) = table.remove(id) {
                if let Some(tx) = waiter {
                    let _ = tx.send(Some(Resolution::cancelled(id)));
                }
                cancelled.push(route);
            }
        }
        cancelled
    }
}
