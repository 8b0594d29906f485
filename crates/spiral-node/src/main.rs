//! # Spiral Node
//!
//! Hosts one orchestrator with its maintenance loop until interrupted.

use std::sync::Arc;

use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::NodeConfig;
use engine::Engine;
use spiral_orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Spiral Node starting...");

    let config = NodeConfig::from_env()?;
    info!(
        "⚙️  tick={}ms voting_window={}ms heartbeat_timeout={}ms",
        config.tick_ms,
        config.orchestrator.voting_window_ms,
        config.orchestrator.registry.heartbeat_timeout_ms
    );

    let orchestrator = Arc::new(Orchestrator::new(config.orchestrator.clone()));
    let engine = Arc::new(Engine::new(
        orchestrator.clone(),
        Duration::from_millis(config.tick_ms),
    ));

    let audit = tokio::spawn(engine.clone().audit());
    let ticking = tokio::spawn(engine.run());

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown requested");

    orchestrator.shutdown().await;
    ticking.await?;
    audit.abort();

    info!("👋 Spiral Node stopped");
    Ok(())
}
