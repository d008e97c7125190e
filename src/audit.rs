// src/audit.rs
//
// Append-only audit trail of match decisions. A failed append aborts the
// resolution of the record in question: no decision without an audit entry.

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use crate::models::{MatchDecision, RecordId};

/// Destination for match decisions. Implementations must surface failures;
/// swallowing one would leave cluster state without lineage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, decision: MatchDecision) -> Result<()>;
}

/// In-memory audit log retaining decisions in arrival order.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<MatchDecision>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<MatchDecision> {
        self.entries.read().await.clone()
    }

    /// Full decision lineage for one record, oldest first.
    pub async fn decisions_for(&self, record: &RecordId) -> Vec<MatchDecision> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|d| &d.record_id == record)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, decision: MatchDecision) -> Result<()> {
        debug!(
            "Audit: record {} -> {} (score {:.4}, trigger {:?})",
            decision.record_id.0,
            decision.decision.as_str(),
            decision.score,
            decision.trigger
        );
        self.entries.write().await.push(decision);
        Ok(())
    }
}
