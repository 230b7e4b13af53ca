//! In-memory stores.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{
    MetadataStore, TransformStore, check_transform_version, stamp_metadata, stamp_transform,
};
use crate::error::{MetadataError, TransformStoreError};
use crate::model::{Transform, TransformMetadata};

#[derive(Default)]
struct MetadataInner {
    visible: HashMap<String, TransformMetadata>,
    /// Unforced writes not yet visible to readers.
    pending: HashMap<String, TransformMetadata>,
    history: Vec<TransformMetadata>,
}

/// Metadata store with refresh semantics.
///
/// Unforced writes become visible only after `refresh()`, forced writes
/// immediately. Every write is recorded in the history.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    inner: Mutex<MetadataInner>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every pending write visible.
    pub fn refresh(&self) {
        let mut inner = self.lock();
        let pending = std::mem::take(&mut inner.pending);
        inner.visible.extend(pending);
    }

    /// Every write, in order.
    pub fn history(&self) -> Vec<TransformMetadata> {
        self.lock().history.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().history.len()
    }

    /// Latest written version of `id`, visible or not.
    pub fn latest(&self, id: &str) -> Option<TransformMetadata> {
        let inner = self.lock();
        inner
            .pending
            .get(id)
            .or_else(|| inner.visible.get(id))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetadataInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn read(&self, id: &str) -> Result<Option<TransformMetadata>, MetadataError> {
        Ok(self.lock().visible.get(id).cloned())
    }

    async fn write(
        &self,
        metadata: TransformMetadata,
        force_refresh: bool,
    ) -> Result<TransformMetadata, MetadataError> {
        let metadata = stamp_metadata(metadata);
        let mut inner = self.lock();

        if force_refresh {
            inner.pending.remove(&metadata.id);
            inner.visible.insert(metadata.id.clone(), metadata.clone());
        } else {
            inner.pending.insert(metadata.id.clone(), metadata.clone());
        }
        inner.history.push(metadata.clone());

        Ok(metadata)
    }
}

/// Transform store backed by a map.
#[derive(Default)]
pub struct InMemoryTransformStore {
    transforms: Mutex<BTreeMap<String, Transform>>,
}

impl InMemoryTransformStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Transform>> {
        self.transforms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TransformStore for InMemoryTransformStore {
    async fn get(&self, id: &str) -> Result<Option<Transform>, TransformStoreError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn put(&self, transform: Transform) -> Result<Transform, TransformStoreError> {
        let mut transforms = self.lock();
        check_transform_version(&transform, transforms.get(&transform.id))?;

        let transform = stamp_transform(transform);
        transforms.insert(transform.id.clone(), transform.clone());
        Ok(transform)
    }

    async fn list(&self) -> Result<Vec<Transform>, TransformStoreError> {
        Ok(self.lock().values().cloned().collect())
    }
}
