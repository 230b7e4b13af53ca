//! Turns aggregation buckets into target documents and writes them.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use glacier_core::emit;
use tracing::debug;

use crate::capability::{CompositeBucket, TargetDocument, WriteCapability};
use crate::error::IndexError;
use crate::metrics::events::{DocumentsIndexed, IndexDuration};
use crate::model::{BucketKey, Metric, Transform};

/// Field holding the number of source documents in a bucket.
pub const DOC_COUNT_FIELD: &str = "_doc_count";
/// Field holding the id of the transform that produced a document.
pub const TRANSFORM_ID_FIELD: &str = "transform._id";

/// Outcome of writing one batch of documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexedBatch {
    pub documents: u64,
    pub took: Duration,
}

#[derive(Clone)]
pub struct TransformIndexer {
    write: Arc<dyn WriteCapability>,
}

impl TransformIndexer {
    pub fn new(write: Arc<dyn WriteCapability>) -> Self {
        Self { write }
    }

    /// Upsert one document per bucket into the transform's target.
    pub async fn index(
        &self,
        transform: &Transform,
        buckets: &[CompositeBucket],
    ) -> Result<IndexedBatch, IndexError> {
        if buckets.is_empty() {
            return Ok(IndexedBatch::default());
        }

        let documents: Vec<TargetDocument> = buckets
            .iter()
            .map(|bucket| target_document(transform, bucket))
            .collect();
        let count = documents.len() as u64;

        let took = self
            .write
            .bulk_upsert(&transform.target_index, documents)
            .await?;

        debug!(target = %transform.id, documents = count, "Indexed documents");
        emit!(DocumentsIndexed {
            transform: transform.id.clone(),
            count,
        });
        emit!(IndexDuration {
            transform: transform.id.clone(),
            duration: took,
        });

        Ok(IndexedBatch {
            documents: count,
            took,
        })
    }
}

/// Stable id of the document for `key`, so recomputing a bucket overwrites
/// its previous document.
pub fn document_id(transform_id: &str, key: &BucketKey) -> String {
    let name = format!("{transform_id}#{key}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

pub fn target_document(transform: &Transform, bucket: &CompositeBucket) -> TargetDocument {
    let mut source = Map::new();

    for group in &transform.groups {
        let value = bucket
            .key
            .get(group.target_field())
            .map(|v| v.to_json())
            .unwrap_or(Value::Null);
        source.insert(group.target_field().to_string(), value);
    }

    for aggregation in &transform.aggregations {
        let value = bucket
            .values
            .get(&aggregation.name)
            .copied()
            .flatten()
            .map(|v| metric_value(aggregation.metric, v))
            .unwrap_or(Value::Null);
        source.insert(aggregation.name.clone(), value);
    }

    source.insert(DOC_COUNT_FIELD.to_string(), Value::from(bucket.doc_count));
    source.insert(
        TRANSFORM_ID_FIELD.to_string(),
        Value::String(transform.id.clone()),
    );

    TargetDocument {
        id: document_id(&transform.id, &bucket.key),
        source,
    }
}

fn metric_value(metric: Metric, value: f64) -> Value {
    match metric {
        Metric::ValueCount => Value::from(value as u64),
        _ => serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bucket(customer: &str, total: Option<f64>) -> CompositeBucket {
        CompositeBucket {
            key: BucketKey::new().with("customer", customer),
            doc_count: 3,
            values: BTreeMap::from([("total".to_string(), total)]),
        }
    }

    #[test]
    fn test_document_id_is_stable_per_transform_and_key() {
        let key = BucketKey::new().with("customer", "alice");
        assert_eq!(document_id("t1", &key), document_id("t1", &key));
        assert_ne!(document_id("t1", &key), document_id("t2", &key));
        assert_ne!(
            document_id("t1", &key),
            document_id("t1", &BucketKey::new().with("customer", "bob"))
        );
    }

    #[test]
    fn test_document_shape() {
        let transform = crate::test_util::transform("t1");
        let doc = target_document(&transform, &bucket("alice", Some(42.5)));

        assert_eq!(doc.source["customer"], Value::from("alice"));
        assert_eq!(doc.source["total"], Value::from(42.5));
        assert_eq!(doc.source[DOC_COUNT_FIELD], Value::from(3u64));
        assert_eq!(doc.source[TRANSFORM_ID_FIELD], Value::from("t1"));
    }

    #[test]
    fn test_missing_metric_is_null() {
        let transform = crate::test_util::transform("t1");
        let doc = target_document(&transform, &bucket("alice", None));
        assert_eq!(doc.source["total"], Value::Null);
    }
}
