//! Internal events emitted while running transforms.
//!
//! Every metric carries a `transform` label so multi-transform deployments
//! can be observed per job.

use glacier_core::metrics::events::InternalEvent;
use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcomeKind {
    Skipped,
    Completed,
    Failed,
    LockLost,
}

impl TickOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickOutcomeKind::Skipped => "skipped",
            TickOutcomeKind::Completed => "completed",
            TickOutcomeKind::Failed => "failed",
            TickOutcomeKind::LockLost => "lock_lost",
        }
    }
}

/// Event emitted when a tick returns.
pub struct TickCompleted {
    pub transform: String,
    pub outcome: TickOutcomeKind,
    pub duration: Duration,
}

impl InternalEvent for TickCompleted {
    fn emit(self) {
        trace!(
            transform = %self.transform,
            outcome = self.outcome.as_str(),
            duration_ms = self.duration.as_millis(),
            "Tick completed"
        );
        counter!(
            "glacier_ticks_total",
            "transform" => self.transform.clone(),
            "outcome" => self.outcome.as_str()
        )
        .increment(1);
        histogram!("glacier_tick_duration_seconds", "transform" => self.transform)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Search side
// ============================================================================

/// Event emitted for every composite aggregation page read.
pub struct PagesProcessed {
    pub transform: String,
    pub count: u64,
}

impl InternalEvent for PagesProcessed {
    fn emit(self) {
        trace!(transform = %self.transform, count = self.count, "Pages processed");
        counter!("glacier_pages_processed_total", "transform" => self.transform)
            .increment(self.count);
    }
}

/// Event emitted when a discovery page yields bucket keys.
pub struct BucketsDiscovered {
    pub transform: String,
    pub count: u64,
}

impl InternalEvent for BucketsDiscovered {
    fn emit(self) {
        trace!(transform = %self.transform, count = self.count, "Buckets discovered");
        counter!("glacier_buckets_discovered_total", "transform" => self.transform)
            .increment(self.count);
    }
}

/// Event emitted after a recompute batch was written and persisted.
pub struct RecomputeBatchCompleted {
    pub transform: String,
    pub buckets: u64,
    pub remaining: u64,
}

impl InternalEvent for RecomputeBatchCompleted {
    fn emit(self) {
        trace!(
            transform = %self.transform,
            buckets = self.buckets,
            remaining = self.remaining,
            "Recompute batch completed"
        );
        counter!("glacier_recompute_batches_total", "transform" => self.transform.clone())
            .increment(1);
        gauge!("glacier_recompute_pending_buckets", "transform" => self.transform)
            .set(self.remaining as f64);
    }
}

/// Event emitted for the time spent in one search request.
pub struct SearchDuration {
    pub transform: String,
    pub duration: Duration,
}

impl InternalEvent for SearchDuration {
    fn emit(self) {
        histogram!("glacier_search_duration_seconds", "transform" => self.transform)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Write side
// ============================================================================

/// Event emitted when output documents were upserted.
pub struct DocumentsIndexed {
    pub transform: String,
    pub count: u64,
}

impl InternalEvent for DocumentsIndexed {
    fn emit(self) {
        trace!(transform = %self.transform, count = self.count, "Documents indexed");
        counter!("glacier_documents_indexed_total", "transform" => self.transform)
            .increment(self.count);
    }
}

/// Event emitted for the time spent in one bulk upsert.
pub struct IndexDuration {
    pub transform: String,
    pub duration: Duration,
}

impl InternalEvent for IndexDuration {
    fn emit(self) {
        histogram!("glacier_index_duration_seconds", "transform" => self.transform)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Locks and checkpoints
// ============================================================================

/// Event emitted when a tick is skipped because another attempt holds the lock.
pub struct LockContended {
    pub transform: String,
}

impl InternalEvent for LockContended {
    fn emit(self) {
        trace!(transform = %self.transform, "Lock contended");
        counter!("glacier_lock_contended_total", "transform" => self.transform).increment(1);
    }
}

/// Event emitted when a held lock could not be renewed.
pub struct LockLost {
    pub transform: String,
}

impl InternalEvent for LockLost {
    fn emit(self) {
        trace!(transform = %self.transform, "Lock lost");
        counter!("glacier_lock_lost_total", "transform" => self.transform).increment(1);
    }
}

/// Event emitted when shards were excluded from a pass.
pub struct ShardsFailed {
    pub transform: String,
    pub count: u64,
}

impl InternalEvent for ShardsFailed {
    fn emit(self) {
        trace!(transform = %self.transform, count = self.count, "Shards failed");
        counter!("glacier_shards_failed_total", "transform" => self.transform)
            .increment(self.count);
    }
}

/// Event emitted when a continuous pass committed its checkpoints.
pub struct CheckpointCommitted {
    pub transform: String,
    /// Sum of committed sequence numbers across shards.
    pub total_seq_no: i64,
}

impl InternalEvent for CheckpointCommitted {
    fn emit(self) {
        trace!(
            transform = %self.transform,
            total_seq_no = self.total_seq_no,
            "Checkpoint committed"
        );
        counter!("glacier_checkpoints_committed_total", "transform" => self.transform.clone())
            .increment(1);
        gauge!("glacier_checkpoint_seq_no", "transform" => self.transform)
            .set(self.total_seq_no as f64);
    }
}
