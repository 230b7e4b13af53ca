//! External capabilities the engine depends on.
//!
//! The transform engine never talks to a storage engine directly. It needs
//! three narrow capabilities: composite-aggregation search, batch upsert
//! of output documents, and per-shard global checkpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{IndexError, SearchError};
use crate::model::{Aggregation, BucketKey, Group, Query, SecurityContext, SeqNo, ShardId, Transform};

/// Mapped type of a source field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Keyword,
    Long,
    Double,
    Date,
    Boolean,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double | FieldType::Date)
    }
}

/// A paginated composite aggregation request.
#[derive(Debug, Clone)]
pub struct CompositeRequest {
    pub index: String,
    pub groups: Vec<Group>,
    /// Metrics computed per bucket; empty for discovery.
    pub aggregations: Vec<Aggregation>,
    pub query: Query,
    pub after_key: Option<BucketKey>,
    pub size: usize,
    /// Restrict the search to a single shard.
    pub shard: Option<ShardId>,
    pub owner: Option<SecurityContext>,
}

/// One bucket of a composite aggregation page.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeBucket {
    pub key: BucketKey,
    pub doc_count: u64,
    /// Aggregation name -> value. `None` when the bucket has no values for
    /// the field (min/max/avg of nothing).
    pub values: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositePage {
    pub buckets: Vec<CompositeBucket>,
    /// Cursor for the next page; `None` once every bucket was returned.
    pub after_key: Option<BucketKey>,
    pub took: Duration,
}

#[async_trait]
pub trait SearchCapability: Send + Sync {
    async fn composite_search(&self, request: CompositeRequest)
    -> Result<CompositePage, SearchError>;

    /// Largest number of bucket keys that can be safely filtered on in a
    /// single recompute request for `transform`.
    async fn max_recompute_batch_size(&self, transform: &Transform) -> Result<usize, SearchError>;

    /// Field mappings of `index`, or `None` if the index does not exist.
    async fn field_mappings(
        &self,
        index: &str,
    ) -> Result<Option<BTreeMap<String, FieldType>>, SearchError>;
}

/// An output document.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDocument {
    pub id: String,
    pub source: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait WriteCapability: Send + Sync {
    /// Upsert `documents` into `index`, returning the time taken.
    ///
    /// Any per-document failure fails the whole batch.
    async fn bulk_upsert(
        &self,
        index: &str,
        documents: Vec<TargetDocument>,
    ) -> Result<Duration, IndexError>;
}

/// Per-shard global checkpoints at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardCheckpoints {
    pub resolved: BTreeMap<ShardId, SeqNo>,
    /// Shards whose checkpoint could not be read.
    pub failed: BTreeSet<ShardId>,
}

#[async_trait]
pub trait SequenceNumberAuthority: Send + Sync {
    async fn global_checkpoints(&self, index: &str) -> Result<ShardCheckpoints, SearchError>;
}
