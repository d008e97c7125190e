// src/review.rs
//
// Review queue: holding area for ambiguous match decisions awaiting human
// adjudication. Items transition pending -> resolved exactly once; the
// engine owns the cluster mutation a merge resolution implies.

use log::info;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    MatchDecision, ReviewItemId, ReviewOutcome, ReviewQueueItem, ReviewStatus,
};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("unknown review item '{0}'")]
    UnknownItem(String),

    #[error("review item '{0}' is already resolved")]
    AlreadyResolved(String),
}

#[derive(Default)]
struct ReviewQueueInner {
    items: Vec<ReviewQueueItem>,
}

/// In-memory review queue, insertion ordered.
#[derive(Default)]
pub struct ReviewQueue {
    inner: RwLock<ReviewQueueInner>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the decision that routed a pair to review.
    pub async fn push(&self, decision: MatchDecision) -> ReviewItemId {
        let id = ReviewItemId(Uuid::new_v4().to_string());
        let item = ReviewQueueItem {
            id: id.clone(),
            decision,
            status: ReviewStatus::Pending,
        };
        let mut inner = self.inner.write().await;
        info!(
            "Queued record {} for review as item {}",
            item.decision.record_id.0, id.0
        );
        inner.items.push(item);
        id
    }

    pub async fn list_pending(&self) -> Vec<ReviewQueueItem> {
        self.inner
            .read()
            .await
            .items
            .iter()
            .filter(|i| i.status == ReviewStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &ReviewItemId) -> Option<ReviewQueueItem> {
        self.inner
            .read()
            .await
            .items
            .iter()
            .find(|i| &i.id == id)
            .cloned()
    }

    /// Mark a pending item resolved and hand back the queueing decision so
    /// the caller can act on the outcome.
    pub async fn mark_resolved(
        &self,
        id: &ReviewItemId,
        outcome: ReviewOutcome,
        actor: &str,
    ) -> Result<MatchDecision, ReviewError> {
        let mut inner = self.inner.write().await;
        let item = inner
            .items
            .iter_mut()
            .find(|i| &i.id == id)
            .ok_or_else(|| ReviewError::UnknownItem(id.0.clone()))?;
        if item.status != ReviewStatus::Pending {
            return Err(ReviewError::AlreadyResolved(id.0.clone()));
        }
        item.status = ReviewStatus::Resolved {
            outcome,
            actor: actor.to_string(),
            resolved_at: chrono::Utc::now(),
        };
        info!(
            "Review item {} resolved as {:?} by {}",
            id.0, outcome, actor
        );
        Ok(item.decision.clone())
    }
}
