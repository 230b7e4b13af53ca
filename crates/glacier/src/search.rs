//! Builds the composite aggregation requests a transform issues and runs
//! them against the search capability.

use std::collections::BTreeSet;
use std::sync::Arc;

use glacier_core::emit;

use crate::capability::{CompositePage, CompositeRequest, SearchCapability};
use crate::error::SearchError;
use crate::metrics::events::SearchDuration;
use crate::model::{BucketKey, Group, KeyValue, Query, ShardNewDocuments, Transform};

/// Relative amount histogram bounds are widened by when the interval is
/// fractional. Bucket keys computed in floating point can land just above
/// the documents they hold.
const FRACTIONAL_WIDENING: f64 = 1e-6;

#[derive(Clone)]
pub struct TransformSearchService {
    search: Arc<dyn SearchCapability>,
}

impl TransformSearchService {
    pub fn new(search: Arc<dyn SearchCapability>) -> Self {
        Self { search }
    }

    /// Run `request` on behalf of `transform`.
    pub async fn search(
        &self,
        transform: &Transform,
        request: CompositeRequest,
    ) -> Result<CompositePage, SearchError> {
        let page = self.search.composite_search(request).await?;
        emit!(SearchDuration {
            transform: transform.id.clone(),
            duration: page.took,
        });
        Ok(page)
    }

    /// Number of bucket keys recomputed per request, as reported by the
    /// search capability. Each request still pages by `page_size`.
    pub async fn recompute_batch_size(&self, transform: &Transform) -> Result<usize, SearchError> {
        let max = self.search.max_recompute_batch_size(transform).await?;
        Ok(max.max(1))
    }
}

/// Request for one discovery page of `shard`: the distinct bucket keys of
/// the shard's operations in `(from_seq_no, to_seq_no]`.
pub fn discovery_request(
    transform: &Transform,
    shard: &ShardNewDocuments,
    after_key: Option<BucketKey>,
) -> CompositeRequest {
    let query = Query::all([
        transform.data_selection_query.clone(),
        Query::SeqNoRange {
            from_exclusive: shard.from_seq_no,
            to_inclusive: shard.to_seq_no,
        },
    ]);

    CompositeRequest {
        index: transform.source_index.clone(),
        groups: transform.groups.clone(),
        aggregations: Vec::new(),
        query,
        after_key,
        size: transform.page_size,
        shard: Some(shard.shard.clone()),
        owner: transform.owner.clone(),
    }
}

/// Request for the full aggregation restricted to `keys`.
pub fn recompute_request(
    transform: &Transform,
    keys: &[BucketKey],
    after_key: Option<BucketKey>,
) -> CompositeRequest {
    let query = Query::all([
        transform.data_selection_query.clone(),
        bucket_filter(&transform.groups, keys),
    ]);

    CompositeRequest {
        index: transform.source_index.clone(),
        groups: transform.groups.clone(),
        aggregations: transform.aggregations.clone(),
        query,
        after_key,
        size: transform.page_size,
        shard: None,
        owner: transform.owner.clone(),
    }
}

/// Request for one page of the full aggregation over the whole source.
pub fn full_pass_request(transform: &Transform, after_key: Option<BucketKey>) -> CompositeRequest {
    CompositeRequest {
        index: transform.source_index.clone(),
        groups: transform.groups.clone(),
        aggregations: transform.aggregations.clone(),
        query: transform.data_selection_query.clone(),
        after_key,
        size: transform.page_size,
        shard: None,
        owner: transform.owner.clone(),
    }
}

/// Filter matching every document that falls in one of `keys`.
///
/// Each group is filtered independently, so the result can also match
/// combinations of values that were not requested. Callers drop those
/// buckets with [`retain_requested`].
pub fn bucket_filter(groups: &[Group], keys: &[BucketKey]) -> Query {
    Query::all(groups.iter().map(|group| group_filter(group, keys)))
}

fn group_filter(group: &Group, keys: &[BucketKey]) -> Query {
    let field = group.source_field().to_string();
    let values: BTreeSet<&KeyValue> = keys
        .iter()
        .filter_map(|key| key.get(group.target_field()))
        .collect();

    let has_null = values.iter().any(|v| v.is_null());
    let mut clauses = Vec::new();

    match group.interval() {
        None => {
            let values: Vec<KeyValue> = values
                .into_iter()
                .filter(|v| !v.is_null())
                .cloned()
                .collect();
            if !values.is_empty() {
                clauses.push(Query::Terms {
                    field: field.clone(),
                    values,
                });
            }
        }
        Some(interval) => {
            let widen = if group.has_fractional_interval() {
                interval * FRACTIONAL_WIDENING
            } else {
                0.0
            };
            clauses.extend(values.into_iter().filter_map(KeyValue::as_f64).map(|lower| {
                Query::Range {
                    field: field.clone(),
                    gte: Some(lower - widen),
                    lt: Some(lower + interval + widen),
                }
            }));
        }
    }

    if has_null {
        clauses.push(Query::not(Query::Exists { field }));
    }

    Query::any(clauses)
}

/// Keep only the buckets whose key was requested.
pub fn retain_requested<T>(
    items: Vec<T>,
    requested: &BTreeSet<BucketKey>,
    key: impl Fn(&T) -> &BucketKey,
) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| requested.contains(key(item)))
        .collect()
}
