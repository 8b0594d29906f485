//! Node configuration from `SPIRAL_*` environment variables.

use std::str::FromStr;

use anyhow::Context as _;
use spiral_orchestrator::OrchestratorConfig;

/// Settings for one node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interval between maintenance ticks (milliseconds).
    pub tick_ms: u64,

    /// Coordination settings.
    pub orchestrator: OrchestratorConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tick_ms: 250,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Read the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "SPIRAL_TICK_MS")? {
            config.tick_ms = v;
        }
        if let Some(v) = parse(&lookup, "SPIRAL_VOTING_WINDOW_MS")? {
            config.orchestrator.voting_window_ms = v;
        }
        if let Some(v) = parse(&lookup, "SPIRAL_HEARTBEAT_TIMEOUT_MS")? {
            config.orchestrator.registry.heartbeat_timeout_ms = v;
        }
        if let Some(v) = parse(&lookup, "SPIRAL_MAX_SUSPENSION_MS")? {
            config.orchestrator.registry.max_suspension_ms = v;
        }
        if let Some(v) = parse(&lookup, "SPIRAL_MAILBOX_CAPACITY")? {
            config.orchestrator.bus.mailbox_capacity = v;
        }
        if let Some(v) = parse(&lookup, "SPIRAL_DEFAULT_DEADLINE_MS")? {
            config.orchestrator.router.default_deadline_ms = Some(v);
        }

        anyhow::ensure!(config.tick_ms > 0, "SPIRAL_TICK_MS must be positive");
        anyhow::ensure!(
            config.orchestrator.bus.mailbox_capacity > 0,
            "SPIRAL_MAILBOX_CAPACITY must be positive"
        );

        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.tick_ms, 250);
        assert_eq!(config.orchestrator.voting_window_ms, 1_000);
        assert!(config.orchestrator.router.default_deadline_ms.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("SPIRAL_TICK_MS", "50"),
            ("SPIRAL_VOTING_WINDOW_MS", "300"),
            ("SPIRAL_HEARTBEAT_TIMEOUT_MS", "2000"),
            ("SPIRAL_MAX_SUSPENSION_MS", "9000"),
            ("SPIRAL_MAILBOX_CAPACITY", "8"),
            ("SPIRAL_DEFAULT_DEADLINE_MS", " 1500 "),
        ]))
        .unwrap();

        assert_eq!(config.tick_ms, 50);
        assert_eq!(config.orchestrator.voting_window_ms, 300);
        assert_eq!(config.orchestrator.registry.heartbeat_timeout_ms, 2_000);
        assert_eq!(config.orchestrator.registry.max_suspension_ms, 9_000);
        assert_eq!(config.orchestrator.bus.mailbox_capacity, 8);
        assert_eq!(config.orchestrator.router.default_deadline_ms, Some(1_500));
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let err = NodeConfig::from_lookup(lookup(&[("SPIRAL_TICK_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("SPIRAL_TICK_MS"));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(NodeConfig::from_lookup(lookup(&[("SPIRAL_MAILBOX_CAPACITY", "0")])).is_err());
    }
}
