//! Recompute of the full aggregation for a set of bucket keys.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::debug;

use crate::capability::{CompositeBucket, CompositePage};
use crate::error::SearchError;
use crate::model::{BucketKey, Transform};
use crate::search::{TransformSearchService, full_pass_request, recompute_request, retain_requested};

/// Result of recomputing one batch of bucket keys.
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputedBatch {
    pub buckets: Vec<CompositeBucket>,
    pub pages: u64,
    pub took: Duration,
}

impl RecomputedBatch {
    pub fn doc_count(&self) -> u64 {
        self.buckets.iter().map(|b| b.doc_count).sum()
    }
}

#[derive(Clone)]
pub struct BucketRecompute {
    search: TransformSearchService,
}

impl BucketRecompute {
    pub fn new(search: TransformSearchService) -> Self {
        Self { search }
    }

    /// Number of keys recomputed per request for `transform`.
    pub async fn batch_size(&self, transform: &Transform) -> Result<usize, SearchError> {
        self.search.recompute_batch_size(transform).await
    }

    /// Re-run the full aggregation restricted to `keys`.
    ///
    /// The filter may match buckets that were not asked for; they are
    /// dropped so only the requested buckets are returned.
    pub async fn recompute_batch(
        &self,
        transform: &Transform,
        keys: &[BucketKey],
    ) -> Result<RecomputedBatch, SearchError> {
        let requested: BTreeSet<BucketKey> = keys.iter().cloned().collect();
        let mut buckets = Vec::with_capacity(keys.len());
        let mut after_key = None;
        let mut pages = 0;
        let mut took = Duration::ZERO;

        loop {
            let request = recompute_request(transform, keys, after_key);
            let page = self.search.search(transform, request).await?;
            pages += 1;
            took += page.took;
            buckets.extend(retain_requested(page.buckets, &requested, |b| &b.key));

            match page.after_key {
                Some(next) => after_key = Some(next),
                None => break,
            }
        }

        debug!(
            target = %transform.id,
            requested = keys.len(),
            recomputed = buckets.len(),
            pages,
            "Recomputed batch"
        );

        Ok(RecomputedBatch {
            buckets,
            pages,
            took,
        })
    }

    /// One page of the full aggregation over the whole source.
    pub async fn full_pass_page(
        &self,
        transform: &Transform,
        after_key: Option<BucketKey>,
    ) -> Result<CompositePage, SearchError> {
        self.search
            .search(transform, full_pass_request(transform, after_key))
            .await
    }
}

/// Split `keys` into consecutive batches of at most `size` keys.
pub fn batches(keys: &BTreeSet<BucketKey>, size: usize) -> Vec<Vec<BucketKey>> {
    let keys: Vec<BucketKey> = keys.iter().cloned().collect();
    keys.chunks(size.max(1)).map(<[BucketKey]>::to_vec).collect()
}
