//! Discovery of the buckets touched by new operations on a shard.

use std::collections::BTreeSet;
use std::time::Duration;

use glacier_core::emit;
use tracing::debug;

use crate::error::SearchError;
use crate::metrics::events::BucketsDiscovered;
use crate::model::{BucketKey, ShardNewDocuments, Transform};
use crate::search::{TransformSearchService, discovery_request};

/// One discovery page of a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPage {
    pub buckets: BTreeSet<BucketKey>,
    /// Cursor of the next page; `None` once the shard is done.
    pub after_key: Option<BucketKey>,
    pub took: Duration,
}

#[derive(Clone)]
pub struct BucketDiscovery {
    search: TransformSearchService,
}

impl BucketDiscovery {
    pub fn new(search: TransformSearchService) -> Self {
        Self { search }
    }

    /// Read the page of bucket keys after `after_key` for `shard`.
    ///
    /// Passing the cursor returned by the previous page continues with the
    /// next one, so a pass interrupted between pages resumes without
    /// re-reading pages that were already merged.
    pub async fn discover_page(
        &self,
        transform: &Transform,
        shard: &ShardNewDocuments,
        after_key: Option<BucketKey>,
    ) -> Result<DiscoveredPage, SearchError> {
        let request = discovery_request(transform, shard, after_key);
        let page = self.search.search(transform, request).await?;

        let buckets: BTreeSet<BucketKey> = page.buckets.into_iter().map(|b| b.key).collect();

        debug!(
            target = %transform.id,
            shard = %shard.shard,
            buckets = buckets.len(),
            more = page.after_key.is_some(),
            "Discovered page"
        );
        emit!(BucketsDiscovered {
            transform: transform.id.clone(),
            count: buckets.len() as u64,
        });

        Ok(DiscoveredPage {
            buckets,
            after_key: page.after_key,
            took: page.took,
        })
    }
}
