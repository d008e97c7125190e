// src/engine.rs
//
// Resolution engine: drives blocking, rule evaluation, and threshold
// decisioning, and owns the record state machine
// (unresolved -> evaluating -> merged | queued | rejected). Queued records
// leave that state only through an explicit human action. Every transition
// appends exactly one decision to the audit sink, and the append happens
// before any cluster mutation: no mutation without a log entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::blocking;
use crate::cluster::{ClusterError, ClusterStore};
use crate::config::ActiveRuleSet;
use crate::matching::evaluator::{self, Evaluation};
use crate::models::{
    CandidateRef, ClusterId, Decision, DecisionId, DecisionTrigger, FieldSchema, MatchDecision,
    RawRecord, RecordId, RecordState, ReviewItemId, ReviewOutcome, ReviewQueueItem,
};
use crate::results::{BatchReport, ResolutionStats};
use crate::review::{ReviewError, ReviewQueue};
use crate::store::EntitySource;

/// Bounded retries for contended cluster merges before the record is given
/// back to the backlog
const MAX_MERGE_ATTEMPTS: usize = 3;
/// Concurrent candidate evaluations per record
const CANDIDATE_EVAL_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown record '{0}'")]
    UnknownRecord(String),

    #[error("entity source failure: {0}")]
    Source(anyhow::Error),

    #[error("audit sink failure: {0}")]
    Audit(anyhow::Error),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error("merge for record '{record}' still contended after {attempts} attempts")]
    Transient { record: String, attempts: usize },

    #[error("record '{0}' is awaiting human review")]
    PendingReview(String),
}

/// A scored candidate, carrying enough context for deterministic selection
/// and for the eventual merge.
struct CandidateScore {
    record: RawRecord,
    evaluation: Evaluation,
    cluster: Option<ClusterId>,
    cluster_last_merged: Option<chrono::DateTime<Utc>>,
}

/// What a merge should attach the record to.
enum MergeTarget<'a> {
    /// A specific cluster the caller named; a stale id surfaces as an error
    Cluster(&'a ClusterId),
    /// Wherever this counterpart record currently lives (a fresh cluster is
    /// seeded with it when it is unclustered)
    Record(&'a RawRecord),
    /// A fresh singleton cluster
    Fresh,
}

pub struct ResolutionEngine {
    source: Arc<dyn EntitySource>,
    clusters: Arc<dyn ClusterStore>,
    audit: Arc<dyn AuditSink>,
    review: Arc<ReviewQueue>,
    schema: FieldSchema,
    rules: RwLock<Arc<ActiveRuleSet>>,
    states: Mutex<HashMap<RecordId, RecordState>>,
    stats: Mutex<ResolutionStats>,
}

impl ResolutionEngine {
    pub fn new(
        source: Arc<dyn EntitySource>,
        clusters: Arc<dyn ClusterStore>,
        audit: Arc<dyn AuditSink>,
        schema: FieldSchema,
        rules: ActiveRuleSet,
    ) -> Self {
        Self {
            source,
            clusters,
            audit,
            review: Arc::new(ReviewQueue::new()),
            schema,
            rules: RwLock::new(Arc::new(rules)),
            states: Mutex::new(HashMap::new()),
            stats: Mutex::new(ResolutionStats::default()),
        }
    }

    /// Swap in a new activated rule set. Applies from the next resolution;
    /// a run in flight keeps the snapshot it started with.
    pub async fn set_rules(&self, rules: ActiveRuleSet) {
        *self.rules.write().await = Arc::new(rules);
        info!("Rule configuration replaced; effective from the next resolution");
    }

    pub fn review_queue(&self) -> Arc<ReviewQueue> {
        Arc::clone(&self.review)
    }

    pub async fn list_pending_reviews(&self) -> Vec<ReviewQueueItem> {
        self.review.list_pending().await
    }

    pub async fn record_state(&self, record: &RecordId) -> RecordState {
        self.states
            .lock()
            .await
            .get(record)
            .cloned()
            .unwrap_or(RecordState::Unresolved)
    }

    pub async fn stats(&self) -> ResolutionStats {
        self.stats.lock().await.clone()
    }

    /// Resolve a single record: blocking, candidate scoring, threshold
    /// decision, and the resulting cluster mutation. Returns the appended
    /// decision.
    pub async fn resolve_record(&self, record_id: &RecordId) -> Result<MatchDecision, EngineError> {
        // Queued records leave that state only through a human verdict
        if self.record_state(record_id).await == RecordState::Queued {
            return Err(EngineError::PendingReview(record_id.0.clone()));
        }

        let record = self
            .source
            .get_record(record_id)
            .await
            .map_err(EngineError::Source)?
            .ok_or_else(|| EngineError::UnknownRecord(record_id.0.clone()))?;

        let prior_cluster = self.clusters.lookup(record_id).await;
        let trigger = if prior_cluster.is_some() {
            DecisionTrigger::ReResolution
        } else {
            DecisionTrigger::Initial
        };
        self.set_state(record_id, RecordState::Evaluating).await;

        let rules = Arc::clone(&*self.rules.read().await);

        let keys = blocking::blocking_keys(&record, &self.schema);
        if keys.is_empty() {
            // No computable blocking key: route straight to review against
            // no candidates rather than dropping the record
            info!(
                "Record {} has no blocking key, routing to review",
                record_id.0
            );
            let decision = build_decision(
                &record,
                None,
                Evaluation::empty(),
                Decision::QueueReview,
                trigger,
                None,
            );
            self.append_audit(record_id, decision.clone()).await?;
            self.review.push(decision.clone()).await;
            self.set_state(record_id, RecordState::Queued).await;
            self.bump_stats(Decision::QueueReview).await;
            return Ok(decision);
        }

        let candidate_ids =
            blocking::generate_candidates(&record, &self.schema, self.source.as_ref())
                .await
                .map_err(EngineError::Source)?;
        debug!(
            "Record {}: {} blocking keys, {} candidates",
            record_id.0,
            keys.len(),
            candidate_ids.len()
        );

        let scored = self.score_candidates(&record, candidate_ids, &rules).await;
        let best = pick_best(scored);

        let thresholds = rules.thresholds();
        let Some(best) = best else {
            // Keys exist but no other record shares them
            let decision = build_decision(
                &record,
                None,
                Evaluation::empty(),
                Decision::Reject,
                trigger,
                None,
            );
            self.append_audit(record_id, decision.clone()).await?;
            self.set_state(record_id, RecordState::Rejected).await;
            self.bump_stats(Decision::Reject).await;
            return Ok(decision);
        };

        let kind = if best.evaluation.score >= thresholds.auto_merge {
            Decision::AutoMerge
        } else if best.evaluation.score >= thresholds.queue_review {
            Decision::QueueReview
        } else {
            Decision::Reject
        };
        let candidate_ref = match &best.cluster {
            Some(cid) => CandidateRef::Cluster(cid.clone()),
            None => CandidateRef::Record(best.record.id.clone()),
        };
        let decision = build_decision(
            &record,
            Some(candidate_ref),
            best.evaluation.clone(),
            kind,
            trigger,
            None,
        );
        self.append_audit(record_id, decision.clone()).await?;

        match kind {
            Decision::AutoMerge => {
                let merge_result = self
                    .merge_into(
                        &record,
                        MergeTarget::Record(&best.record),
                        best.evaluation.score,
                        prior_cluster.as_ref(),
                    )
                    .await;
                match merge_result {
                    Ok(cluster_id) => {
                        self.set_state(record_id, RecordState::Merged(cluster_id))
                            .await;
                        self.bump_stats(Decision::AutoMerge).await;
                    }
                    Err(e) => {
                        self.set_state(record_id, RecordState::Unresolved).await;
                        return Err(e);
                    }
                }
            }
            Decision::QueueReview => {
                self.review.push(decision.clone()).await;
                self.set_state(record_id, RecordState::Queued).await;
                self.bump_stats(Decision::QueueReview).await;
            }
            Decision::Reject => {
                self.set_state(record_id, RecordState::Rejected).await;
                self.bump_stats(Decision::Reject).await;
            }
        }

        Ok(decision)
    }

    /// Resolve a pending review item with a human verdict. Produces a new
    /// decision carrying the actor; a merge verdict applies the cluster
    /// mutation the queued decision proposed.
    pub async fn resolve_review(
        &self,
        item_id: &ReviewItemId,
        outcome: ReviewOutcome,
        actor: &str,
    ) -> Result<MatchDecision, EngineError> {
        let queued = self.review.mark_resolved(item_id, outcome, actor).await?;
        let record = self
            .source
            .get_record(&queued.record_id)
            .await
            .map_err(EngineError::Source)?
            .ok_or_else(|| EngineError::UnknownRecord(queued.record_id.0.clone()))?;

        let kind = match outcome {
            ReviewOutcome::Merge => Decision::AutoMerge,
            ReviewOutcome::Reject => Decision::Reject,
        };
        let decision = MatchDecision {
            id: DecisionId(Uuid::new_v4().to_string()),
            record_id: record.id.clone(),
            candidate: queued.candidate.clone(),
            score: queued.score,
            matched_rule_names: queued.matched_rule_names.clone(),
            decision: kind,
            trigger: DecisionTrigger::ReviewOverride,
            overridden_by: Some(actor.to_string()),
            decided_at: Utc::now(),
        };
        self.append_audit(&record.id, decision.clone()).await?;

        match outcome {
            ReviewOutcome::Merge => {
                let prior = self.clusters.lookup(&record.id).await;
                let target = match &queued.candidate {
                    Some(CandidateRef::Cluster(cid)) => MergeTarget::Cluster(cid),
                    Some(CandidateRef::Record(other_id)) => {
                        let other = self
                            .source
                            .get_record(other_id)
                            .await
                            .map_err(EngineError::Source)?
                            .ok_or_else(|| EngineError::UnknownRecord(other_id.0.clone()))?;
                        return self
                            .finish_review_merge(&record, MergeTarget::Record(&other), &decision, prior.as_ref())
                            .await;
                    }
                    // A record queued without candidates becomes its own
                    // canonical entity when the reviewer confirms it
                    None => MergeTarget::Fresh,
                };
                self.finish_review_merge(&record, target, &decision, prior.as_ref())
                    .await
            }
            ReviewOutcome::Reject => {
                self.set_state(&record.id, RecordState::Rejected).await;
                self.bump_stats(Decision::Reject).await;
                Ok(decision)
            }
        }
    }

    async fn finish_review_merge(
        &self,
        record: &RawRecord,
        target: MergeTarget<'_>,
        decision: &MatchDecision,
        prior: Option<&ClusterId>,
    ) -> Result<MatchDecision, EngineError> {
        match self.merge_into(record, target, decision.score, prior).await {
            Ok(cluster_id) => {
                self.set_state(&record.id, RecordState::Merged(cluster_id))
                    .await;
                self.bump_stats(Decision::AutoMerge).await;
                Ok(decision.clone())
            }
            Err(e) => {
                self.set_state(&record.id, RecordState::Unresolved).await;
                Err(e)
            }
        }
    }

    /// Reviewer override that attaches a record to a named cluster without
    /// scoring. Logged like any other decision, with the actor recorded.
    pub async fn force_merge(
        &self,
        record_id: &RecordId,
        cluster_id: &ClusterId,
        actor: &str,
    ) -> Result<MatchDecision, EngineError> {
        let record = self
            .source
            .get_record(record_id)
            .await
            .map_err(EngineError::Source)?
            .ok_or_else(|| EngineError::UnknownRecord(record_id.0.clone()))?;
        let prior = self.clusters.lookup(record_id).await;

        let decision = MatchDecision {
            id: DecisionId(Uuid::new_v4().to_string()),
            record_id: record.id.clone(),
            candidate: Some(CandidateRef::Cluster(cluster_id.clone())),
            score: 1.0,
            matched_rule_names: Vec::new(),
            decision: Decision::AutoMerge,
            trigger: DecisionTrigger::ReviewOverride,
            overridden_by: Some(actor.to_string()),
            decided_at: Utc::now(),
        };
        self.append_audit(record_id, decision.clone()).await?;

        match self
            .merge_into(&record, MergeTarget::Cluster(cluster_id), 1.0, prior.as_ref())
            .await
        {
            Ok(cid) => {
                self.set_state(record_id, RecordState::Merged(cid)).await;
                self.bump_stats(Decision::AutoMerge).await;
                Ok(decision)
            }
            Err(e) => {
                self.set_state(record_id, RecordState::Unresolved).await;
                Err(e)
            }
        }
    }

    /// Correct an erroneous merge: split the record out into its own
    /// cluster. The engine state follows the store.
    pub async fn split_record(
        &self,
        cluster_id: &ClusterId,
        record_id: &RecordId,
    ) -> Result<ClusterId, EngineError> {
        let new_cluster = self.clusters.split(cluster_id, record_id).await?;
        self.set_state(record_id, RecordState::Merged(new_cluster.clone()))
            .await;
        Ok(new_cluster)
    }

    /// Process a backlog of records in order. Cancellation is cooperative
    /// and takes effect between records: the in-flight record always
    /// completes its decision, the remainder stays unresolved for the next
    /// run.
    pub async fn run_batch(&self, backlog: &[RecordId], cancel: &AtomicBool) -> BatchReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let timer = Instant::now();
        info!(
            "Starting resolution run {} over {} records",
            run_id,
            backlog.len()
        );

        let mut report = BatchReport {
            run_id,
            started_at,
            records_total: backlog.len(),
            records_processed: 0,
            auto_merged: 0,
            queued_for_review: 0,
            rejected: 0,
            failures: 0,
            cancelled: false,
            total_processing_time: 0.0,
        };

        for record_id in backlog {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                warn!(
                    "Run {} cancelled with {} records remaining",
                    report.run_id,
                    report.records_total - report.records_processed - report.failures
                );
                break;
            }
            match self.resolve_record(record_id).await {
                Ok(decision) => {
                    report.records_processed += 1;
                    match decision.decision {
                        Decision::AutoMerge => report.auto_merged += 1,
                        Decision::QueueReview => report.queued_for_review += 1,
                        Decision::Reject => report.rejected += 1,
                    }
                }
                Err(e) => {
                    warn!("Record {} not resolved this run: {}", record_id.0, e);
                    report.failures += 1;
                }
            }
        }

        report.total_processing_time = timer.elapsed().as_secs_f64();
        self.stats.lock().await.last_run = Some(Utc::now());
        report.log_summary();
        report
    }

    async fn score_candidates(
        &self,
        record: &RawRecord,
        candidate_ids: Vec<RecordId>,
        rules: &Arc<ActiveRuleSet>,
    ) -> Vec<CandidateScore> {
        let results: Vec<Option<CandidateScore>> = stream::iter(candidate_ids)
            .map(|cand_id| {
                let rules = Arc::clone(rules);
                async move {
                    let cand = match self.source.get_record(&cand_id).await {
                        Ok(Some(c)) => c,
                        Ok(None) => {
                            warn!("Candidate {} vanished from the entity source", cand_id.0);
                            return None;
                        }
                        Err(e) => {
                            warn!("Failed to fetch candidate {}: {}", cand_id.0, e);
                            return None;
                        }
                    };
                    if cand.entity_type != record.entity_type {
                        return None;
                    }
                    let evaluation = evaluator::evaluate_pair(record, &cand, rules.rules());
                    let cluster = self.clusters.lookup(&cand.id).await;
                    let cluster_last_merged = match &cluster {
                        Some(cid) => self.clusters.get(cid).await.map(|e| e.last_merged_at),
                        None => None,
                    };
                    Some(CandidateScore {
                        record: cand,
                        evaluation,
                        cluster,
                        cluster_last_merged,
                    })
                }
            })
            .buffer_unordered(CANDIDATE_EVAL_WORKERS)
            .collect()
            .await;
        results.into_iter().flatten().collect()
    }

    /// Attach a record to the target with bounded retries around stale
    /// references. A record moving between clusters detaches first; if the
    /// subsequent merge loses a race the record is left unassigned and the
    /// caller reports it unresolved.
    async fn merge_into(
        &self,
        record: &RawRecord,
        target: MergeTarget<'_>,
        score: f64,
        prior: Option<&ClusterId>,
    ) -> Result<ClusterId, EngineError> {
        // A caller-named cluster must exist before anything is touched; a
        // stale id surfaces without side effects
        if let MergeTarget::Cluster(cid) = &target {
            if self.clusters.get(cid).await.is_none() {
                return Err(ClusterError::UnknownCluster(cid.0.clone()).into());
            }
        }

        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            let target_cluster: Option<ClusterId> = match &target {
                MergeTarget::Cluster(cid) => Some((*cid).clone()),
                MergeTarget::Record(cand) => self.clusters.lookup(&cand.id).await,
                MergeTarget::Fresh => None,
            };

            if let (Some(p), Some(t)) = (prior, target_cluster.as_ref()) {
                if p == t {
                    // Re-resolution landed on the current cluster
                    return Ok(t.clone());
                }
            }
            if self.clusters.lookup(&record.id).await.is_some() {
                self.clusters.detach(&record.id).await?;
            }

            let outcome = match (target_cluster, &target) {
                (Some(cid), _) => self.clusters.merge(Some(&cid), record, score).await,
                (None, MergeTarget::Record(cand)) => {
                    match self.clusters.merge(None, cand, score).await {
                        Ok(cid) => self.clusters.merge(Some(&cid), record, score).await,
                        Err(e) => Err(e),
                    }
                }
                (None, _) => self.clusters.merge(None, record, score).await,
            };

            match outcome {
                Ok(cluster_id) => return Ok(cluster_id),
                Err(ClusterError::UnknownCluster(id)) => {
                    if matches!(target, MergeTarget::Cluster(_)) {
                        // Caller named the cluster; a stale id is theirs to
                        // re-fetch, never silently recreated here
                        return Err(ClusterError::UnknownCluster(id).into());
                    }
                    warn!(
                        "Merge attempt {}/{} for record {} hit a stale cluster ref, retrying",
                        attempt, MAX_MERGE_ATTEMPTS, record.id.0
                    );
                }
                Err(ClusterError::AlreadyAssigned { .. }) => {
                    warn!(
                        "Merge attempt {}/{} for record {} raced a concurrent assignment, retrying",
                        attempt, MAX_MERGE_ATTEMPTS, record.id.0
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Transient {
            record: record.id.0.clone(),
            attempts: MAX_MERGE_ATTEMPTS,
        })
    }

    /// Append a decision to the audit sink. On failure the record reverts
    /// to unresolved and nothing else happens: fail closed.
    async fn append_audit(
        &self,
        record_id: &RecordId,
        decision: MatchDecision,
    ) -> Result<(), EngineError> {
        match self.audit.append(decision).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(record_id, RecordState::Unresolved).await;
                Err(EngineError::Audit(e))
            }
        }
    }

    async fn set_state(&self, record_id: &RecordId, state: RecordState) {
        self.states.lock().await.insert(record_id.clone(), state);
    }

    async fn bump_stats(&self, decision: Decision) {
        let mut stats = self.stats.lock().await;
        stats.total_processed += 1;
        match decision {
            Decision::AutoMerge => stats.auto_merged += 1,
            Decision::QueueReview => stats.queued_for_review += 1,
            Decision::Reject => stats.rejected += 1,
        }
    }
}

fn build_decision(
    record: &RawRecord,
    candidate: Option<CandidateRef>,
    evaluation: Evaluation,
    decision: Decision,
    trigger: DecisionTrigger,
    overridden_by: Option<String>,
) -> MatchDecision {
    MatchDecision {
        id: DecisionId(Uuid::new_v4().to_string()),
        record_id: record.id.clone(),
        candidate,
        score: evaluation.score,
        matched_rule_names: evaluation.matched_rule_names,
        decision,
        trigger,
        overridden_by,
        decided_at: Utc::now(),
    }
}

/// Highest score wins; ties go to the most recently merged cluster, then to
/// record id order so selection is deterministic.
fn pick_best(mut candidates: Vec<CandidateScore>) -> Option<CandidateScore> {
    candidates.sort_by(|a, b| {
        b.evaluation
            .score
            .total_cmp(&a.evaluation.score)
            .then_with(|| b.cluster_last_merged.cmp(&a.cluster_last_merged))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    candidates.into_iter().next()
}
