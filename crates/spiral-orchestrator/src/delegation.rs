//! Delegation chains for choice contexts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spiral_core::{AgentId, PrimitiveId, Result, SpiralError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// The agents that have successively handed on one choice context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    /// The delegated context.
    pub context_id: PrimitiveId,

    /// Delegating agents in order. The first entry is the originator.
    pub chain: Vec<AgentId>,

    /// The agent currently holding the context.
    pub holder: AgentId,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl DelegationRecord {
    /// The agent that started the chain.
    pub fn originator(&self) -> &str {
        self.chain.first().unwrap_or(&self.holder)
    }

    /// Check if an agent already took part in the chain.
    pub fn involves(&self, agent_id: &str) -> bool {
        self.chain.iter().any(|a| a == agent_id)
    }
}

/// DELEGATE message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationHandOff {
    pub context_id: PrimitiveId,

    /// Chain so far, originator first.
    pub chain: Vec<AgentId>,

    /// True when the context comes back to its originator after a cycle.
    #[serde(default)]
    pub returned: bool,
}

/// Live delegation chains keyed by context.
#[derive(Default)]
pub struct DelegationLedger {
    records: RwLock<HashMap<PrimitiveId, DelegationRecord>>,
}

impl DelegationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a context from `from` to `to`.
    ///
    /// `from` is appended to the chain. If `to` is already in the chain the
    /// chain is dropped and the error names the originator the context
    /// returns to.
    pub async fn delegate(
        &self,
        context_id: PrimitiveId,
        from: &str,
        to: &str,
    ) -> Result<DelegationRecord> {
        let mut records = self.records.write().await;
        let now = Utc::now();

        let record = records
            .entry(context_id)
            .or_insert_with(|| DelegationRecord {
                context_id,
                chain: Vec::new(),
                holder: from.to_string(),
                created_at: now,
                updated_at: now,
            });

        if record.holder != from {
            return Err(SpiralError::NotDelegationHolder {
                context_id,
                agent_id: from.to_string(),
                holder: record.holder.clone(),
            });
        }

        let mut chain = record.chain.clone();
        chain.push(from.to_string());

        if chain.iter().any(|a| a == to) {
            let returned_to = chain[0].clone();
            records.remove(&context_id);
            warn!(
                "Delegation cycle on {}: {} -> {}, returning to '{}'",
                context_id,
                chain.join(" -> "),
                to,
                returned_to
            );
            return Err(SpiralError::DelegationCycle {
                context_id,
                target: to.to_string(),
                chain,
                returned_to,
            });
        }

        record.chain = chain;
        record.holder = to.to_string();
        record.updated_at = now;
        debug!("Delegated {} from '{}' to '{}'", context_id, from, to);
        Ok(record.clone())
    }

    /// Close the chain once the context is resolved.
    pub async fn complete(&self, context_id: PrimitiveId) -> Option<DelegationRecord> {
        self.records.write().await.remove(&context_id)
    }

    pub async fn get(&self, context_id: PrimitiveId) -> Option<DelegationRecord> {
        self.records.read().await.get(&context_id).cloned()
    }

    /// Drop every chain an agent holds or took part in.
    pub async fn forget_agent(&self, agent_id: &str) -> Vec<PrimitiveId> {
        let mut records = self.records.write().await;
        let dropped: Vec<PrimitiveId> = records
            .values()
            .filter(|r| r.holder == agent_id || r.involves(agent_id))
            .map(|r| r.context_id)
            .collect();
        for id in &dropped {
            records.remove(id);
        }
        dropped
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_chain_without_repeat_succeeds() {
        let ledger = DelegationLedger::new();
        let ctx = Uuid::new_v4();

        ledger.delegate(ctx, "a", "b").await.unwrap();
        let record = ledger.delegate(ctx, "b", "c").await.unwrap();

        assert_eq!(record.chain, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(record.holder, "c");
        assert_eq!(record.originator(), "a");
    }

    #[tokio::test]
    async fn test_cycle_returns_to_originator() {
        let ledger = DelegationLedger::new();
        let ctx = Uuid::new_v4();

        ledger.delegate(ctx, "a", "b").await.unwrap();
        ledger.delegate(ctx, "b", "c").await.unwrap();
        let err = ledger.delegate(ctx, "c", "a").await.unwrap_err();

        match err {
            SpiralError::DelegationCycle {
                returned_to, chain, ..
            } => {
                assert_eq!(returned_to, "a");
                assert_eq!(chain.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ledger.get(ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_self_delegation_is_a_cycle() {
        let ledger = DelegationLedger::new();
        let err = ledger.delegate(Uuid::new_v4(), "a", "a").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_only_holder_may_delegate() {
        let ledger = DelegationLedger::new();
        let ctx = Uuid::new_v4();
        ledger.delegate(ctx, "a", "b").await.unwrap();

        let err = ledger.delegate(ctx, "a", "c").await.unwrap_err();
        assert!(matches!(err, SpiralError::NotDelegationHolder { .. }));
    }

    #[tokio::test]
    async fn test_complete_and_forget() {
        let ledger = DelegationLedger::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        ledger.delegate(first, "a", "b").await.unwrap();
        ledger.delegate(second, "c", "d").await.unwrap();

        assert!(ledger.complete(first).await.is_some());
        assert_eq!(ledger.forget_agent("d").await, vec![second]);
        assert!(ledger.is_empty().await);
    }
}
