//! Maintenance loop and kernel audit log.

use std::sync::Arc;

use chrono::Utc;
use spiral_kernel::KernelEventKind;
use spiral_orchestrator::Orchestrator;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drives the orchestrator's time-based work.
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    tick: Duration,
}

impl Engine {
    pub fn new(orchestrator: Arc<Orchestrator>, tick: Duration) -> Self {
        Self { orchestrator, tick }
    }

    /// Tick until the orchestrator shuts down.
    pub async fn run(self: Arc<Self>) {
        info!("🔧 Engine started, ticking every {:?}", self.tick);

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.orchestrator.is_closed() {
            ticker.tick().await;

            let report = self.orchestrator.tick(Utc::now()).await;
            for expired in &report.expired {
                info!(
                    "⏰ Deadline passed on {}: {:?} {:?}",
                    expired.route.primitive_id,
                    expired.resolution.status,
                    expired.resolution.selected
                );
            }
            for agent in &report.sweep.suspended {
                warn!("💤 Agent '{}' suspended", agent);
            }
            for agent in &report.sweep.terminated {
                warn!("🪦 Agent '{}' evicted", agent);
            }
            if !report.expired_requests.is_empty() {
                debug!("Retired {} stale requests", report.expired_requests.len());
            }
        }

        info!("🔧 Engine stopped");
    }

    /// Log every kernel transition until the kernel goes away.
    pub async fn audit(self: Arc<Self>) {
        let mut events = self.orchestrator.kernel().subscribe();
        while let Some(event) = events.next().await {
            match event.kind {
                KernelEventKind::Selected => info!(
                    "✅ Tree {} selected {:?} on {:?}, {} spawned",
                    event.tree_id,
                    event.option,
                    event.primitive_id,
                    event.affected.len()
                ),
                kind => debug!(
                    "Tree {} {:?} on {:?} ({} affected)",
                    event.tree_id,
                    kind,
                    event.primitive_id,
                    event.affected.len()
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiral_orchestrator::OrchestratorConfig;
    use spiral_router::Intent;

    #[tokio::test]
    async fn test_run_applies_deadline_default() {
        let orchestrator = Arc::new(Orchestrator::new(OrchestratorConfig::default()));
        let routed = orchestrator
            .router()
            .route(
                Intent::builder()
                    .requester("ui")
                    .options(["A", "B"])
                    .match_on("domain", "storage")
                    .deadline(chrono::Duration::milliseconds(20))
                    .default_option("B")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        let engine = Arc::new(Engine::new(orchestrator.clone(), Duration::from_millis(10)));
        let handle = tokio::spawn(engine.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let primitive = orchestrator.kernel().get(routed.primitive_id).await.unwrap();
        assert_eq!(primitive.selected(), Some("B"));

        orchestrator.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
