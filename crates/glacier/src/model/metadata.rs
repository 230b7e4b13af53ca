//! Execution state of a transform, persisted after every unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::bucket::BucketKey;
use super::shard::{SeqNo, ShardId, ShardNewDocuments};
use super::transform::{UNASSIGNED_PRIMARY_TERM, UNASSIGNED_SEQ_NO};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    /// Created, no work done yet.
    Init,
    Started,
    Stopped,
    Finished,
    Failed,
}

impl TransformStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformStatus::Init => "init",
            TransformStatus::Started => "started",
            TransformStatus::Stopped => "stopped",
            TransformStatus::Finished => "finished",
            TransformStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransformStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative counters across every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformStats {
    pub pages_processed: u64,
    pub documents_processed: u64,
    pub documents_indexed: u64,
    pub index_time_ms: u64,
    pub search_time_ms: u64,
}

impl TransformStats {
    pub fn merge(&mut self, other: &TransformStats) {
        self.pages_processed += other.pages_processed;
        self.documents_processed += other.documents_processed;
        self.documents_indexed += other.documents_indexed;
        self.index_time_ms += other.index_time_ms;
        self.search_time_ms += other.search_time_ms;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousStats {
    /// Capture instant of the last committed checkpoint snapshot.
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassPhase {
    Discovering,
    Recomputing,
}

/// An in-progress continuous pass.
///
/// Persisted with the metadata so a restarted tick resumes the same pass:
/// discovery continues from `shard_cursor` and the stored after-key, and
/// recompute continues with the keys still in `modified_buckets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousPass {
    pub captured_at: DateTime<Utc>,
    /// Global checkpoints captured at the start of the pass.
    pub checkpoints: BTreeMap<ShardId, SeqNo>,
    pub shards: Vec<ShardNewDocuments>,
    pub shard_cursor: usize,
    #[serde(default)]
    pub failed_shards: BTreeSet<ShardId>,
    #[serde(default)]
    pub modified_buckets: BTreeSet<BucketKey>,
    pub phase: PassPhase,
}

impl ContinuousPass {
    pub fn new(
        captured_at: DateTime<Utc>,
        checkpoints: BTreeMap<ShardId, SeqNo>,
        failed_shards: BTreeSet<ShardId>,
        shards: Vec<ShardNewDocuments>,
    ) -> Self {
        Self {
            captured_at,
            checkpoints,
            shards,
            shard_cursor: 0,
            failed_shards,
            modified_buckets: BTreeSet::new(),
            phase: PassPhase::Discovering,
        }
    }

    /// Shard currently being discovered, if discovery is not done.
    pub fn current_shard(&self) -> Option<&ShardNewDocuments> {
        match self.phase {
            PassPhase::Discovering => self.shards.get(self.shard_cursor),
            PassPhase::Recomputing => None,
        }
    }
}

/// Execution state of one transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformMetadata {
    pub id: String,
    pub transform_id: String,
    pub status: TransformStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Pagination cursor; set only while a pagination pass is in progress.
    #[serde(default)]
    pub after_key: Option<BucketKey>,
    /// Highest sequence number per shard already reflected in the target.
    #[serde(default)]
    pub shard_checkpoints: BTreeMap<ShardId, SeqNo>,
    #[serde(default)]
    pub stats: TransformStats,
    #[serde(default)]
    pub continuous_stats: Option<ContinuousStats>,
    #[serde(default)]
    pub pass: Option<ContinuousPass>,
    pub last_updated_at: DateTime<Utc>,
    pub seq_no: i64,
    pub primary_term: i64,
}

impl TransformMetadata {
    /// Fresh metadata for a transform that has never run.
    pub fn new(id: impl Into<String>, transform_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            transform_id: transform_id.into(),
            status: TransformStatus::Init,
            failure_reason: None,
            after_key: None,
            shard_checkpoints: BTreeMap::new(),
            stats: TransformStats::default(),
            continuous_stats: None,
            pass: None,
            last_updated_at: now,
            seq_no: UNASSIGNED_SEQ_NO,
            primary_term: UNASSIGNED_PRIMARY_TERM,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TransformStatus::Failed;
        self.failure_reason = Some(reason.into());
    }

    /// Whether the status ends ticks before any work is done.
    pub fn is_halted(&self) -> bool {
        matches!(
            self.status,
            TransformStatus::Stopped | TransformStatus::Finished
        )
    }
}
