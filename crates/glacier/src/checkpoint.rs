//! Per-shard progress tracking.
//!
//! A transform's committed checkpoint maps each source shard to the highest
//! sequence number already reflected in the target. Each continuous pass
//! captures the shards' current global checkpoints, processes the operations
//! in between, and commits the captured values for every shard that did not
//! fail.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::SequenceNumberAuthority;
use crate::error::SearchError;
use crate::model::{SeqNo, ShardId, ShardNewDocuments};

/// Global checkpoints of a source index captured at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSnapshot {
    pub captured_at: DateTime<Utc>,
    pub checkpoints: BTreeMap<ShardId, SeqNo>,
    /// Shards whose checkpoint could not be resolved.
    pub failed: BTreeSet<ShardId>,
}

pub struct CheckpointTracker {
    authority: Arc<dyn SequenceNumberAuthority>,
}

impl CheckpointTracker {
    pub fn new(authority: Arc<dyn SequenceNumberAuthority>) -> Self {
        Self { authority }
    }

    /// Capture the current global checkpoint of every shard of `index`.
    pub async fn current_global_checkpoints(
        &self,
        index: &str,
    ) -> Result<CheckpointSnapshot, SearchError> {
        let captured_at = Utc::now();
        let resolved = self.authority.global_checkpoints(index).await?;

        if !resolved.failed.is_empty() {
            warn!(
                index,
                failed = resolved.failed.len(),
                "Could not resolve global checkpoint of some shards"
            );
        }
        debug!(index, shards = resolved.resolved.len(), "Captured global checkpoints");

        Ok(CheckpointSnapshot {
            captured_at,
            checkpoints: resolved.resolved,
            failed: resolved.failed,
        })
    }
}

/// Shards with operations between `committed` and `current`, in shard order.
///
/// A shard absent from `committed` has never been processed, so all of its
/// operations are in scope as long as it has any.
pub fn shard_delta(
    committed: &BTreeMap<ShardId, SeqNo>,
    current: &BTreeMap<ShardId, SeqNo>,
) -> Vec<ShardNewDocuments> {
    current
        .iter()
        .filter_map(|(shard, &to_seq_no)| {
            let from_seq_no = committed.get(shard).copied();
            let advanced = match from_seq_no {
                Some(from) => to_seq_no > from,
                None => to_seq_no >= 0,
            };
            advanced.then(|| ShardNewDocuments {
                shard: shard.clone(),
                from_seq_no,
                to_seq_no,
            })
        })
        .collect()
}

/// Checkpoints to commit once a pass over `snapshot` completed.
///
/// Failed shards keep their previously committed value so their operations
/// are picked up again by the next pass. A committed value never moves
/// backwards.
pub fn committed_checkpoints(
    previous: &BTreeMap<ShardId, SeqNo>,
    snapshot: &BTreeMap<ShardId, SeqNo>,
    failed: &BTreeSet<ShardId>,
) -> BTreeMap<ShardId, SeqNo> {
    let mut committed = previous.clone();
    for (shard, &seq_no) in snapshot {
        if failed.contains(shard) {
            continue;
        }
        committed
            .entry(shard.clone())
            .and_modify(|current| *current = (*current).max(seq_no))
            .or_insert(seq_no);
    }
    committed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ShardCheckpoints;
    use async_trait::async_trait;

    fn shard(n: u32) -> ShardId {
        ShardId::new("orders", n)
    }

    #[test]
    fn test_delta_includes_only_advanced_shards() {
        let committed = BTreeMap::from([(shard(0), 10), (shard(1), 5)]);
        let current = BTreeMap::from([(shard(0), 10), (shard(1), 8), (shard(2), 3)]);

        let delta = shard_delta(&committed, &current);
        assert_eq!(
            delta,
            vec![
                ShardNewDocuments {
                    shard: shard(1),
                    from_seq_no: Some(5),
                    to_seq_no: 8,
                },
                ShardNewDocuments {
                    shard: shard(2),
                    from_seq_no: None,
                    to_seq_no: 3,
                },
            ]
        );
    }

    #[test]
    fn test_delta_skips_empty_new_shard() {
        let current = BTreeMap::from([(shard(0), crate::model::NO_OPS_PERFORMED)]);
        assert!(shard_delta(&BTreeMap::new(), &current).is_empty());
    }

    #[test]
    fn test_commit_excludes_failed_shards() {
        let previous = BTreeMap::from([(shard(0), 3), (shard(1), 4)]);
        let snapshot = BTreeMap::from([(shard(0), 9), (shard(1), 9), (shard(2), 9)]);
        let failed = BTreeSet::from([shard(1)]);

        let committed = committed_checkpoints(&previous, &snapshot, &failed);
        assert_eq!(
            committed,
            BTreeMap::from([(shard(0), 9), (shard(1), 4), (shard(2), 9)])
        );
    }

    #[test]
    fn test_commit_never_moves_backwards() {
        let previous = BTreeMap::from([(shard(0), 12)]);
        let snapshot = BTreeMap::from([(shard(0), 7)]);

        let committed = committed_checkpoints(&previous, &snapshot, &BTreeSet::new());
        assert_eq!(committed[&shard(0)], 12);
    }

    struct FixedAuthority(ShardCheckpoints);

    #[async_trait]
    impl SequenceNumberAuthority for FixedAuthority {
        async fn global_checkpoints(&self, _index: &str) -> Result<ShardCheckpoints, SearchError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_snapshot_reports_failed_shards() {
        let tracker = CheckpointTracker::new(Arc::new(FixedAuthority(ShardCheckpoints {
            resolved: BTreeMap::from([(shard(0), 4)]),
            failed: BTreeSet::from([shard(1)]),
        })));

        let before = Utc::now();
        let snapshot = tracker.current_global_checkpoints("orders").await.unwrap();
        assert!(snapshot.captured_at >= before);
        assert_eq!(snapshot.checkpoints, BTreeMap::from([(shard(0), 4)]));
        assert_eq!(snapshot.failed, BTreeSet::from([shard(1)]));
    }
}
