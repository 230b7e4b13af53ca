//! Stores persisted as JSON objects through a `StorageProvider`.
//!
//! Layout under the state location:
//! - `transforms/{id}.json`
//! - `metadata/{id}.json`
//!
//! Every write goes through `atomic_write`, so a record is never read
//! half-written.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use snafu::prelude::*;
use tokio::sync::Mutex;
use tracing::debug;

use glacier_core::storage::StorageProviderRef;

use super::{
    MetadataStore, TransformStore, check_transform_version, stamp_metadata, stamp_transform,
};
use crate::error::{
    MetadataDecodeSnafu, MetadataEncodeSnafu, MetadataError, MetadataStorageSnafu,
    TransformDecodeSnafu, TransformEncodeSnafu, TransformStorageSnafu, TransformStoreError,
};
use crate::model::{Transform, TransformMetadata};

pub const TRANSFORMS_DIR: &str = "transforms";
pub const METADATA_DIR: &str = "metadata";

fn record_path(dir: &str, id: &str) -> Path {
    Path::from(format!("{dir}/{id}.json"))
}

/// Durable metadata store. Writes are visible as soon as they return.
pub struct StorageMetadataStore {
    storage: StorageProviderRef,
}

impl StorageMetadataStore {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl MetadataStore for StorageMetadataStore {
    async fn read(&self, id: &str) -> Result<Option<TransformMetadata>, MetadataError> {
        let Some(bytes) = self
            .storage
            .get_opt(&record_path(METADATA_DIR, id))
            .await
            .context(MetadataStorageSnafu)?
        else {
            return Ok(None);
        };

        let metadata = serde_json::from_slice(&bytes).context(MetadataDecodeSnafu { id })?;
        Ok(Some(metadata))
    }

    async fn write(
        &self,
        metadata: TransformMetadata,
        _force_refresh: bool,
    ) -> Result<TransformMetadata, MetadataError> {
        let metadata = stamp_metadata(metadata);
        let json = serde_json::to_vec_pretty(&metadata).context(MetadataEncodeSnafu {
            id: metadata.id.as_str(),
        })?;

        self.storage
            .atomic_write(&record_path(METADATA_DIR, &metadata.id), Bytes::from(json))
            .await
            .context(MetadataStorageSnafu)?;

        debug!(
            id = %metadata.id,
            status = %metadata.status,
            seq_no = metadata.seq_no,
            "Wrote metadata"
        );
        Ok(metadata)
    }
}

/// Durable transform store.
///
/// Version checks and writes are serialized by a process-wide mutex, so
/// this store must be the only writer of its location.
pub struct StorageTransformStore {
    storage: StorageProviderRef,
    write_lock: Mutex<()>,
}

impl StorageTransformStore {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    async fn read(&self, path: &Path, id: &str) -> Result<Option<Transform>, TransformStoreError> {
        let Some(bytes) = self
            .storage
            .get_opt(path)
            .await
            .context(TransformStorageSnafu)?
        else {
            return Ok(None);
        };

        let transform = serde_json::from_slice(&bytes).context(TransformDecodeSnafu { id })?;
        Ok(Some(transform))
    }
}

#[async_trait]
impl TransformStore for StorageTransformStore {
    async fn get(&self, id: &str) -> Result<Option<Transform>, TransformStoreError> {
        self.read(&record_path(TRANSFORMS_DIR, id), id).await
    }

    async fn put(&self, transform: Transform) -> Result<Transform, TransformStoreError> {
        let _guard = self.write_lock.lock().await;
        let path = record_path(TRANSFORMS_DIR, &transform.id);

        let stored = self.read(&path, &transform.id).await?;
        check_transform_version(&transform, stored.as_ref())?;

        let transform = stamp_transform(transform);
        let json = serde_json::to_vec_pretty(&transform).context(TransformEncodeSnafu {
            id: transform.id.as_str(),
        })?;
        self.storage
            .atomic_write(&path, Bytes::from(json))
            .await
            .context(TransformStorageSnafu)?;

        debug!(id = %transform.id, seq_no = transform.seq_no, "Wrote transform");
        Ok(transform)
    }

    async fn list(&self) -> Result<Vec<Transform>, TransformStoreError> {
        let paths = self
            .storage
            .list_with_prefix(TRANSFORMS_DIR)
            .await
            .context(TransformStorageSnafu)?;

        let mut transforms = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(id) = path
                .filename()
                .and_then(|name| name.strip_suffix(".json"))
                .map(str::to_string)
            else {
                continue;
            };
            if let Some(transform) = self.read(&path, &id).await? {
                transforms.push(transform);
            }
        }
        Ok(transforms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use glacier_core::storage::StorageProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn local_storage(dir: &TempDir) -> StorageProviderRef {
        Arc::new(
            StorageProvider::for_url(dir.path().to_str().unwrap())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_metadata_survives_restart() {
        let dir = TempDir::new().unwrap();
        let metadata = TransformMetadata::new("m1", "t1", Utc::now());

        let written = StorageMetadataStore::new(local_storage(&dir).await)
            .write(metadata, false)
            .await
            .unwrap();

        let reopened = StorageMetadataStore::new(local_storage(&dir).await);
        assert_eq!(reopened.read("m1").await.unwrap(), Some(written));
        assert!(reopened.read("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transform_store_roundtrip_and_conflict() {
        let dir = TempDir::new().unwrap();
        let store = StorageTransformStore::new(local_storage(&dir).await);

        let created = store.put(crate::test_util::transform("t1")).await.unwrap();
        store.put(crate::test_util::transform("t2")).await.unwrap();
        assert_eq!(store.get("t1").await.unwrap(), Some(created.clone()));

        let mut update = created.clone();
        update.page_size = 50;
        store.put(update).await.unwrap();

        assert!(store.put(created).await.unwrap_err().is_version_conflict());

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let storage = local_storage(&dir).await;
        storage
            .put(&record_path(METADATA_DIR, "m1"), Bytes::from_static(b"{not json"))
            .await
            .unwrap();

        let err = StorageMetadataStore::new(storage).read("m1").await.unwrap_err();
        assert!(matches!(err, MetadataError::MetadataDecode { .. }));
    }
}
