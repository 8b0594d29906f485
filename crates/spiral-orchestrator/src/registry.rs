//! Agent registry and lifecycle.
//!
//! `UNREGISTERED -> REGISTERED -> ACTIVE <-> SUSPENDED -> TERMINATED`
//!
//! The map lock is only taken for writing on registration and eviction.
//! Heartbeats and sweeps lock one record at a time, so agents never contend
//! with each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use spiral_core::{AgentId, Result, SpiralError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Not known to the registry.
    Unregistered,
    /// Capabilities declared, no heartbeat yet.
    Registered,
    /// Heartbeating; eligible to vote.
    Active,
    /// Missed its heartbeat deadline.
    Suspended,
    /// Deregistered or evicted. Terminal.
    Terminated,
}

/// What an agent declares when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    /// Unique agent id.
    pub agent_id: AgentId,

    /// Capability tags the agent handles.
    pub capabilities: BTreeSet<String>,

    /// Weight of the agent's votes.
    pub priority_weight: f64,
}

impl CapabilityDeclaration {
    /// Create a declaration with no capabilities.
    pub fn new(agent_id: impl Into<AgentId>, priority_weight: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: BTreeSet::new(),
            priority_weight,
        }
    }

    /// Add a capability tag.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,

    pub capabilities: BTreeSet<String>,

    /// Vote weight, clamped to a non-negative finite value.
    pub priority_weight: f64,

    pub state: AgentState,

    /// Last heartbeat, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// When the agent was suspended.
    pub suspended_at: Option<DateTime<Utc>>,

    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Check if the agent declared a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Check if the agent's votes count.
    pub fn can_vote(&self) -> bool {
        self.state == AgentState::Active
    }
}

/// Heartbeat policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// An ACTIVE agent silent for longer than this is suspended (milliseconds).
    pub heartbeat_timeout_ms: u64,

    /// A SUSPENDED agent silent for longer than this is terminated (milliseconds).
    pub max_suspension_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            max_suspension_ms: 300_000,
        }
    }
}

/// Transitions made by one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub suspended: Vec<AgentId>,
    pub terminated: Vec<AgentId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.suspended.is_empty() && self.terminated.is_empty()
    }
}

/// Registry of live agents.
pub struct AgentRegistry {
    config: RegistryConfig,
    records: RwLock<HashMap<AgentId, Arc<Mutex<AgentRecord>>>>,
}

impl AgentRegistry {
    /// Create a new registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Register an agent from its capability declaration.
    pub async fn register(&self, declaration: CapabilityDeclaration) -> Result<AgentRecord> {
        let agent_id = declaration.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(SpiralError::UnknownAgent { agent_id });
        }

        let mut records = self.records.write().await;
        if records.contains_key(&agent_id) {
            return Err(SpiralError::AgentAlreadyRegistered { agent_id });
        }

        let weight = declaration.priority_weight;
        let record = AgentRecord {
            agent_id: agent_id.clone(),
            capabilities: declaration.capabilities,
            priority_weight: if weight.is_finite() { weight.max(0.0) } else { 0.0 },
            state: AgentState::Registered,
            last_heartbeat: None,
            suspended_at: None,
            registered_at: Utc::now(),
        };
        records.insert(agent_id.clone(), Arc::new(Mutex::new(record.clone())));

        info!("Registered agent '{}' ({} capabilities)", agent_id, record.capabilities.len());
        Ok(record)
    }

    async fn entry(&self, agent_id: &str) -> Result<Arc<Mutex<AgentRecord>>> {
        self.records
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SpiralError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })
    }

    /// Record a heartbeat. REGISTERED and SUSPENDED agents become ACTIVE.
    pub async fn heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<AgentState> {
        let entry = self.entry(agent_id).await?;
        let mut record = entry.lock().await;

        match record.state {
            AgentState::Terminated | AgentState::Unregistered => {
                return Err(SpiralError::AgentTerminated {
                    agent_id: agent_id.to_string(),
                })
            }
            AgentState::Suspended => {
                info!("Agent '{}' resumed", agent_id);
            }
            AgentState::Registered => {
                debug!("Agent '{}' is active", agent_id);
            }
            AgentState::Active => {}
        }

        record.state = AgentState::Active;
        record.last_heartbeat = Some(now);
        record.suspended_at = None;
        Ok(record.state)
    }

    /// Apply heartbeat deadlines as of `now`.
    ///
    /// Terminated agents are evicted from the registry.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let heartbeat_timeout = Duration::milliseconds(self.config.heartbeat_timeout_ms as i64);
        let max_suspension = Duration::milliseconds(self.config.max_suspension_ms as i64);
        let entries: Vec<Arc<Mutex<AgentRecord>>> =
            self.records.read().await.values().cloned().collect();

        let mut report = SweepReport::default();
        for entry in entries {
            let mut record = entry.lock().await;
            match record.state {
                AgentState::Active => {
                    let silent_since = record.last_heartbeat.unwrap_or(record.registered_at);
                    if now - silent_since > heartbeat_timeout {
                        record.state = AgentState::Suspended;
                        record.suspended_at = Some(now);
                        warn!("Agent '{}' missed its heartbeat, suspended", record.agent_id);
                        report.suspended.push(record.agent_id.clone());
                    }
                }
                AgentState::Suspended => {
                    let since = record.suspended_at.unwrap_or(now);
                    if now - since > max_suspension {
                        record.state = AgentState::Terminated;
                        warn!("Agent '{}' exceeded max suspension, terminated", record.agent_id);
                        report.terminated.push(record.agent_id.clone());
                    }
                }
                _ => {}
            }
        }

        if !report.terminated.is_empty() {
            let mut records = self.records.write().await;
            for id in &report.terminated {
                records.remove(id);
            }
        }
        report.suspended.sort();
        report.terminated.sort();
        report
    }

    /// Deregister an agent. The returned record is TERMINATED.
    pub async fn deregister(&self, agent_id: &str) -> Result<AgentRecord> {
        let entry = self
            .records
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| SpiralError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;

        let mut record = entry.lock().await;
        record.state = AgentState::Terminated;
        info!("Deregistered agent '{}'", agent_id);
        Ok(record.clone())
    }

    /// Get a copy of a record.
    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        let entry = self.entry(agent_id).await.ok()?;
        let record = entry.lock().await;
        Some(record.clone())
    }

    /// Current lifecycle state; unknown ids are UNREGISTERED.
    pub async fn state(&self, agent_id: &str) -> AgentState {
        self.get(agent_id)
            .await
            .map_or(AgentState::Unregistered, |r| r.state)
    }

    /// All records, ordered by agent id.
    pub async fn agents(&self) -> Vec<AgentRecord> {
        let entries: Vec<Arc<Mutex<AgentRecord>>> =
            self.records.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// ACTIVE agents, ordered by agent id.
    pub async fn active_agents(&self) -> Vec<AgentRecord> {
        let mut agents = self.agents().await;
        agents.retain(AgentRecord::can_vote);
        agents
    }

    /// Reachable agents declaring a capability, highest weight first.
    pub async fn with_capability(&self, capability: &str) -> Vec<AgentRecord> {
        let mut agents = self.agents().await;
        agents.retain(|r| {
            r.has_capability(capability)
                && matches!(r.state, AgentState::Registered | AgentState::Active)
        });
        agents.sort_by(|a, b| {
            b.priority_weight
                .total_cmp(&a.priority_weight)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        agents
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(RegistryConfig {
            heartbeat_timeout_ms: 1_000,
            max_suspension_ms: 5_000,
        })
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let registry = registry();
        let t0 = Utc::now();

        assert_eq!(registry.state("x").await, AgentState::Unregistered);
        registry.register(CapabilityDeclaration::new("x", 1.0)).await.unwrap();
        assert_eq!(registry.state("x").await, AgentState::Registered);

        registry.heartbeat("x", t0).await.unwrap();
        assert_eq!(registry.state("x").await, AgentState::Active);

        let report = registry.sweep(t0 + Duration::seconds(2)).await;
        assert_eq!(report.suspended, vec!["x".to_string()]);
        assert_eq!(registry.state("x").await, AgentState::Suspended);

        // Suspension is reversible.
        registry.heartbeat("x", t0 + Duration::seconds(3)).await.unwrap();
        assert_eq!(registry.state("x").await, AgentState::Active);

        registry.sweep(t0 + Duration::seconds(5)).await;
        let report = registry.sweep(t0 + Duration::seconds(11)).await;
        assert_eq!(report.terminated, vec!["x".to_string()]);
        assert_eq!(registry.state("x").await, AgentState::Unregistered);
        assert!(registry.heartbeat("x", t0).await.is_err());
    }

    #[tokio::test]
    async fn test_registered_without_heartbeat_is_not_suspended() {
        let registry = registry();
        registry.register(CapabilityDeclaration::new("x", 1.0)).await.unwrap();

        let report = registry.sweep(Utc::now() + Duration::seconds(60)).await;
        assert!(report.is_empty());
        assert_eq!(registry.state("x").await, AgentState::Registered);
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let registry = registry();
        registry.register(CapabilityDeclaration::new("x", 1.0)).await.unwrap();
        let err = registry
            .register(CapabilityDeclaration::new("x", 2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, SpiralError::AgentAlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = registry();
        registry.register(CapabilityDeclaration::new("x", 1.0)).await.unwrap();

        let record = registry.deregister("x").await.unwrap();
        assert_eq!(record.state, AgentState::Terminated);
        assert!(registry.is_empty().await);
        assert!(registry.deregister("x").await.is_err());
    }

    #[tokio::test]
    async fn test_capability_lookup() {
        let registry = registry();
        registry
            .register(CapabilityDeclaration::new("low", 1.0).with_capability("storage"))
            .await
            .unwrap();
        registry
            .register(CapabilityDeclaration::new("high", 3.0).with_capability("storage"))
            .await
            .unwrap();
        registry
            .register(CapabilityDeclaration::new("net", 5.0).with_capability("network"))
            .await
            .unwrap();

        let ids: Vec<String> = registry
            .with_capability("storage")
            .await
            .into_iter()
            .map(|r| r.agent_id)
            .collect();
        assert_eq!(ids, vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn test_weight_is_clamped() {
        let registry = registry();
        let record = registry
            .register(CapabilityDeclaration::new("x", f64::NAN))
            .await
            .unwrap();
        assert_eq!(record.priority_weight, 0.0);
    }
}
