// src/results.rs

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

/// Aggregate resolution counters, exposed as a read-only snapshot for
/// observability tooling.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionStats {
    /// Records that completed a resolution decision
    pub total_processed: u64,
    pub auto_merged: u64,
    pub queued_for_review: u64,
    pub rejected: u64,
    /// End of the most recent batch run
    pub last_run: Option<DateTime<Utc>>,
}

/// Summary of one batch resolution run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,

    /// Size of the backlog handed to the run
    pub records_total: usize,
    /// Records that reached a decision this run
    pub records_processed: usize,
    pub auto_merged: usize,
    pub queued_for_review: usize,
    pub rejected: usize,
    /// Records left unresolved by transient failures
    pub failures: usize,
    /// True when cooperative cancellation stopped the run early
    pub cancelled: bool,

    pub total_processing_time: f64,
}

impl BatchReport {
    pub fn log_summary(&self) {
        info!(
            "Run {} complete in {:.2}s: {}/{} records processed ({} merged, {} queued, {} rejected, {} failures){}",
            self.run_id,
            self.total_processing_time,
            self.records_processed,
            self.records_total,
            self.auto_merged,
            self.queued_for_review,
            self.rejected,
            self.failures,
            if self.cancelled { ", cancelled" } else { "" }
        );
    }
}
