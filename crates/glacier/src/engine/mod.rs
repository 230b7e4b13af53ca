//! In-memory sharded document engine.
//!
//! Serves as the source dataset of the `glacier` binary and as the search,
//! write and sequence number capabilities in tests. Each index is split
//! into shards; every write to a shard gets that shard's next sequence
//! number, and a shard's global checkpoint is the highest sequence number
//! assigned so far.

mod aggregate;
mod index;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::capability::{
    CompositePage, CompositeRequest, FieldType, SearchCapability, SequenceNumberAuthority,
    ShardCheckpoints, TargetDocument, WriteCapability,
};
use crate::error::{IndexError, SearchError};
use crate::model::{SeqNo, ShardId, Transform};

use index::IndexState;

/// Default limit on the number of clauses in one query.
pub const DEFAULT_MAX_CLAUSE_COUNT: usize = 1024;

pub struct DocumentEngine {
    indices: RwLock<BTreeMap<String, IndexState>>,
    max_clause_count: RwLock<usize>,
}

impl Default for DocumentEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentEngine {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(BTreeMap::new()),
            max_clause_count: RwLock::new(DEFAULT_MAX_CLAUSE_COUNT),
        }
    }

    pub fn set_max_clause_count(&self, max: usize) {
        *self
            .max_clause_count
            .write()
            .unwrap_or_else(|e| e.into_inner()) = max.max(1);
    }

    pub fn max_clause_count(&self) -> usize {
        *self
            .max_clause_count
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, IndexState>> {
        self.indices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, IndexState>> {
        self.indices.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `name` with `shards` shards. Creating an existing index is a
    /// no-op.
    pub fn create_index(&self, name: &str, shards: u32, mappings: BTreeMap<String, FieldType>) {
        self.write()
            .entry(name.to_string())
            .or_insert_with(|| IndexState::new(name, shards, mappings));
    }

    pub fn index_exists(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Index a document, returning the shard and sequence number it got.
    ///
    /// Documents with an id are routed by it and replace the previous
    /// version; documents without one are spread round-robin.
    pub fn index_document(
        &self,
        index: &str,
        id: Option<&str>,
        source: Map<String, Value>,
    ) -> Result<(ShardId, SeqNo), SearchError> {
        let mut indices = self.write();
        let state = indices
            .get_mut(index)
            .ok_or_else(|| SearchError::IndexNotFound {
                index: index.to_string(),
            })?;
        Ok(state.index(id, source))
    }

    /// Make a shard fail (or recover) every request scoped to it.
    pub fn set_shard_available(&self, shard: &ShardId, available: bool) {
        if let Some(state) = self
            .write()
            .get_mut(&shard.index)
            .and_then(|index| index.shard_mut(shard))
        {
            state.available = available;
        }
    }

    /// Make an index reject (or accept) writes.
    pub fn set_writable(&self, index: &str, writable: bool) {
        if let Some(state) = self.write().get_mut(index) {
            state.writable = writable;
        }
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        let indices = self.read();
        let state = indices.get(index)?;
        state
            .documents()
            .find(|(doc_id, _)| doc_id.as_str() == id)
            .map(|(_, doc)| doc.source.clone())
    }

    /// Every document of `index`, keyed by id.
    pub fn documents(&self, index: &str) -> BTreeMap<String, Map<String, Value>> {
        self.read()
            .get(index)
            .map(|state| {
                state
                    .documents()
                    .map(|(id, doc)| (id.clone(), doc.source.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchCapability for DocumentEngine {
    async fn composite_search(
        &self,
        request: CompositeRequest,
    ) -> Result<CompositePage, SearchError> {
        let start = Instant::now();

        let max = self.max_clause_count();
        let count = request.query.clause_count();
        if count > max {
            return Err(SearchError::TooManyClauses { count, max });
        }
        if request.size == 0 {
            return Err(SearchError::InvalidRequest {
                message: "composite page size must be positive".to_string(),
            });
        }

        let indices = self.read();
        let state = indices
            .get(&request.index)
            .ok_or_else(|| SearchError::IndexNotFound {
                index: request.index.clone(),
            })?;

        let shards: Vec<_> = match &request.shard {
            Some(id) => vec![state.shard(id).ok_or_else(|| SearchError::InvalidRequest {
                message: format!("unknown shard {id}"),
            })?],
            None => state.shards.iter().collect(),
        };
        if let Some(down) = shards.iter().find(|s| !s.available) {
            return Err(SearchError::ShardUnavailable {
                shard: down.id.clone(),
            });
        }

        let query = &request.query;
        let documents = shards
            .iter()
            .flat_map(|s| s.documents.values())
            .filter(|doc| aggregate::matches(query, &doc.source, doc.seq_no))
            .map(|doc| &doc.source);

        let (buckets, after_key) = aggregate::composite(
            documents,
            &request.groups,
            &request.aggregations,
            request.after_key.as_ref(),
            request.size,
        );

        Ok(CompositePage {
            buckets,
            after_key,
            took: start.elapsed(),
        })
    }

    async fn max_recompute_batch_size(&self, transform: &Transform) -> Result<usize, SearchError> {
        let available = self
            .max_clause_count()
            .saturating_sub(transform.data_selection_query.clause_count());
        Ok((available / transform.groups.len().max(1)).max(1))
    }

    async fn field_mappings(
        &self,
        index: &str,
    ) -> Result<Option<BTreeMap<String, FieldType>>, SearchError> {
        Ok(self.read().get(index).map(|state| state.mappings.clone()))
    }
}

#[async_trait]
impl WriteCapability for DocumentEngine {
    async fn bulk_upsert(
        &self,
        index: &str,
        documents: Vec<TargetDocument>,
    ) -> Result<Duration, IndexError> {
        let start = Instant::now();
        let mut indices = self.write();
        let state = indices
            .entry(index.to_string())
            .or_insert_with(|| IndexState::new(index, 1, BTreeMap::new()));

        if !state.writable {
            return Err(IndexError::TargetUnavailable {
                index: index.to_string(),
            });
        }

        let mut failures = Vec::new();
        for document in documents {
            let rejected: Vec<String> = document
                .source
                .iter()
                .filter_map(|(field, value)| state.check_value(field, value).err())
                .collect();
            if rejected.is_empty() {
                state.index(Some(&document.id), document.source);
            } else {
                failures.push(format!("doc {}: {}", document.id, rejected.join(", ")));
            }
        }

        if failures.is_empty() {
            Ok(start.elapsed())
        } else {
            Err(IndexError::BulkFailures { failures })
        }
    }
}

#[async_trait]
impl SequenceNumberAuthority for DocumentEngine {
    async fn global_checkpoints(&self, index: &str) -> Result<ShardCheckpoints, SearchError> {
        let indices = self.read();
        let state = indices.get(index).ok_or_else(|| SearchError::IndexNotFound {
            index: index.to_string(),
        })?;

        let mut resolved = BTreeMap::new();
        let mut failed = BTreeSet::new();
        for shard in &state.shards {
            if shard.available {
                resolved.insert(shard.id.clone(), shard.global_checkpoint());
            } else {
                failed.insert(shard.id.clone());
            }
        }
        Ok(ShardCheckpoints { resolved, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketKey, Query};
    use serde_json::json;

    fn engine_with_orders() -> DocumentEngine {
        let engine = DocumentEngine::new();
        engine.create_index("orders", 2, BTreeMap::new());
        for (id, customer, amount) in [("1", "alice", 10), ("2", "bob", 5), ("3", "alice", 1)] {
            let source = json!({"customer": customer, "amount": amount});
            engine
                .index_document("orders", Some(id), source.as_object().cloned().unwrap())
                .unwrap();
        }
        engine
    }

    fn request(transform: &Transform) -> CompositeRequest {
        crate::search::full_pass_request(transform, None)
    }

    #[tokio::test]
    async fn test_full_aggregation() {
        let engine = engine_with_orders();
        let transform = crate::test_util::transform("t1");

        let page = engine.composite_search(request(&transform)).await.unwrap();
        assert_eq!(page.after_key, None);
        assert_eq!(page.buckets.len(), 2);
        assert_eq!(page.buckets[0].key, BucketKey::new().with("customer", "alice"));
        assert_eq!(page.buckets[0].values["total"], Some(11.0));
    }

    #[tokio::test]
    async fn test_checkpoints_and_unavailable_shard() {
        let engine = engine_with_orders();
        let checkpoints = engine.global_checkpoints("orders").await.unwrap();
        let total_ops: i64 = checkpoints.resolved.values().map(|s| s + 1).sum();
        assert_eq!(total_ops, 3);

        let shard = ShardId::new("orders", 1);
        engine.set_shard_available(&shard, false);
        let checkpoints = engine.global_checkpoints("orders").await.unwrap();
        assert_eq!(checkpoints.failed, BTreeSet::from([shard.clone()]));

        let mut req = request(&crate::test_util::transform("t1"));
        req.shard = Some(shard.clone());
        let err = engine.composite_search(req).await.unwrap_err();
        assert_eq!(err.failed_shard(), Some(&shard));
    }

    #[tokio::test]
    async fn test_clause_limit() {
        let engine = engine_with_orders();
        engine.set_max_clause_count(1);
        let mut req = request(&crate::test_util::transform("t1"));
        req.query = Query::Terms {
            field: "customer".to_string(),
            values: vec!["alice".into(), "bob".into()],
        };

        let err = engine.composite_search(req).await.unwrap_err();
        assert!(matches!(err, SearchError::TooManyClauses { count: 2, max: 1 }));
    }

    #[tokio::test]
    async fn test_batch_size_divides_clause_limit_by_groups() {
        let engine = DocumentEngine::new();
        engine.set_max_clause_count(100);
        let mut transform = crate::test_util::transform("t1");
        assert_eq!(engine.max_recompute_batch_size(&transform).await.unwrap(), 100);

        transform.groups.push(crate::model::Group::Terms {
            source_field: "region".to_string(),
            target_field: None,
        });
        assert_eq!(engine.max_recompute_batch_size(&transform).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_bulk_upsert_reports_mapping_conflicts() {
        let engine = DocumentEngine::new();
        engine.create_index(
            "out",
            1,
            BTreeMap::from([("total".to_string(), FieldType::Double)]),
        );

        let doc = |id: &str, total: Value| TargetDocument {
            id: id.to_string(),
            source: json!({ "total": total }).as_object().cloned().unwrap(),
        };
        let err = engine
            .bulk_upsert("out", vec![doc("a", json!(1.0)), doc("b", json!("x"))])
            .await
            .unwrap_err();

        assert!(matches!(err, IndexError::BulkFailures { ref failures } if failures.len() == 1));
        assert!(engine.document("out", "a").is_some());
        assert!(engine.document("out", "b").is_none());

        engine.set_writable("out", false);
        let err = engine.bulk_upsert("out", vec![]).await.unwrap_err();
        assert!(matches!(err, IndexError::TargetUnavailable { .. }));
    }
}
