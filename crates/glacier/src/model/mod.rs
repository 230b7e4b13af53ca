//! Data model: transforms, their execution metadata, bucket keys, shards
//! and filter queries.

pub mod bucket;
pub mod metadata;
pub mod query;
pub mod shard;
pub mod transform;

pub use bucket::{BucketKey, KeyValue};
pub use metadata::{
    ContinuousPass, ContinuousStats, PassPhase, TransformMetadata, TransformStats, TransformStatus,
};
pub use query::Query;
pub use shard::{NO_OPS_PERFORMED, SeqNo, ShardId, ShardNewDocuments};
pub use transform::{
    Aggregation, Group, MAX_PAGE_SIZE, Metric, Schedule, SecurityContext, Transform,
    UNASSIGNED_PRIMARY_TERM, UNASSIGNED_SEQ_NO,
};
