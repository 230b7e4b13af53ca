//! Target documents written as JSON objects to storage.
//!
//! Each document lives at `{index}/{id}.json`, so upserting a document
//! replaces its previous version.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use object_store::path::Path;
use std::time::{Duration, Instant};
use tracing::warn;

use glacier_core::storage::StorageProviderRef;

use crate::capability::{TargetDocument, WriteCapability};
use crate::error::IndexError;

/// Document writes in flight per bulk request.
const MAX_CONCURRENT_WRITES: usize = 16;

pub struct StorageDocumentSink {
    storage: StorageProviderRef,
}

impl StorageDocumentSink {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    pub fn document_path(index: &str, id: &str) -> Path {
        Path::from(format!("{index}/{id}.json"))
    }
}

#[async_trait]
impl WriteCapability for StorageDocumentSink {
    async fn bulk_upsert(
        &self,
        index: &str,
        documents: Vec<TargetDocument>,
    ) -> Result<Duration, IndexError> {
        let start = Instant::now();

        let writes = documents.into_iter().map(|document| async move {
            let json = serde_json::to_vec(&document.source)
                .map_err(|e| format!("doc {}: {e}", document.id))?;
            let path = Self::document_path(index, &document.id);
            self.storage
                .atomic_write(&path, Bytes::from(json))
                .await
                .map_err(|e| {
                    warn!(path = %path, error = %e, "Failed to write document");
                    format!("doc {}: {e}", document.id)
                })
        });

        let failures: Vec<String> = stream::iter(writes)
            .buffer_unordered(MAX_CONCURRENT_WRITES)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        if failures.is_empty() {
            Ok(start.elapsed())
        } else {
            Err(IndexError::BulkFailures { failures })
        }
    }
}
