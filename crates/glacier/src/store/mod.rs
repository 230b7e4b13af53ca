//! Persistence of transform records and their execution metadata.
//!
//! Both records carry a version stamp (`seq_no`, `primary_term`) assigned by
//! the store on every write. Transform records are updated optimistically:
//! a write based on a stale version fails with `VersionConflict`. Metadata
//! writes always overwrite.

mod memory;
mod storage;

pub use memory::{InMemoryMetadataStore, InMemoryTransformStore};
pub use storage::{StorageMetadataStore, StorageTransformStore};

use async_trait::async_trait;
use snafu::OptionExt;

use crate::error::{MetadataError, TransformNotFoundSnafu, TransformStoreError};
use crate::model::{Transform, TransformMetadata, UNASSIGNED_SEQ_NO};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read the metadata `id`, if it exists.
    async fn read(&self, id: &str) -> Result<Option<TransformMetadata>, MetadataError>;

    /// Write `metadata`, returning it with its new version stamp.
    ///
    /// With `force_refresh` the write is visible to the next `read`.
    async fn write(
        &self,
        metadata: TransformMetadata,
        force_refresh: bool,
    ) -> Result<TransformMetadata, MetadataError>;
}

#[async_trait]
pub trait TransformStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Transform>, TransformStoreError>;

    /// Create or update `transform`.
    ///
    /// A transform with an unassigned `seq_no` is created and must not exist
    /// yet; otherwise its version stamp must match the stored one.
    async fn put(&self, transform: Transform) -> Result<Transform, TransformStoreError>;

    async fn list(&self) -> Result<Vec<Transform>, TransformStoreError>;
}

/// Apply `mutate` to `current` and store it.
///
/// On a version conflict the record is read again and the mutation is
/// retried once against the fresh copy.
pub async fn update_transform<F>(
    store: &dyn TransformStore,
    current: &Transform,
    mutate: F,
) -> Result<Transform, TransformStoreError>
where
    F: Fn(&mut Transform) + Send + Sync,
{
    let mut record = current.clone();
    mutate(&mut record);

    match store.put(record).await {
        Err(e) if e.is_version_conflict() => {
            let mut fresh = store
                .get(&current.id)
                .await?
                .context(TransformNotFoundSnafu {
                    id: current.id.as_str(),
                })?;
            mutate(&mut fresh);
            store.put(fresh).await
        }
        other => other,
    }
}

/// Version stamp following `(seq_no, primary_term)`.
pub(crate) fn next_version(seq_no: i64, primary_term: i64) -> (i64, i64) {
    let seq_no = if seq_no < 0 { 0 } else { seq_no + 1 };
    (seq_no, primary_term.max(1))
}

/// Check that `incoming` was based on the `stored` version.
pub(crate) fn check_transform_version(
    incoming: &Transform,
    stored: Option<&Transform>,
) -> Result<(), TransformStoreError> {
    let actual = stored.map(|t| t.seq_no).unwrap_or(UNASSIGNED_SEQ_NO);
    let matches = match stored {
        None => incoming.seq_no == UNASSIGNED_SEQ_NO,
        Some(stored) => {
            incoming.seq_no == stored.seq_no && incoming.primary_term == stored.primary_term
        }
    };

    if matches {
        Ok(())
    } else {
        Err(TransformStoreError::VersionConflict {
            id: incoming.id.clone(),
            expected: incoming.seq_no,
            actual,
        })
    }
}

/// Stamp `transform` with the version following its current one.
pub(crate) fn stamp_transform(mut transform: Transform) -> Transform {
    let (seq_no, primary_term) = next_version(transform.seq_no, transform.primary_term);
    transform.seq_no = seq_no;
    transform.primary_term = primary_term;
    transform
}

pub(crate) fn stamp_metadata(mut metadata: TransformMetadata) -> TransformMetadata {
    let (seq_no, primary_term) = next_version(metadata.seq_no, metadata.primary_term);
    metadata.seq_no = seq_no;
    metadata.primary_term = primary_term;
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version() {
        assert_eq!(next_version(UNASSIGNED_SEQ_NO, 0), (0, 1));
        assert_eq!(next_version(0, 1), (1, 1));
        assert_eq!(next_version(41, 3), (42, 3));
    }

    #[test]
    fn test_version_check() {
        let stored = stamp_transform(crate::test_util::transform("t1"));
        let fresh = crate::test_util::transform("t1");

        assert!(check_transform_version(&fresh, None).is_ok());
        assert!(check_transform_version(&stored, Some(&stored)).is_ok());

        let err = check_transform_version(&fresh, Some(&stored)).unwrap_err();
        assert!(err.is_version_conflict());

        let err = check_transform_version(&stored, None).unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn test_update_retries_once_on_conflict() {
        let store = InMemoryTransformStore::new();
        let stale = store.put(crate::test_util::transform("t1")).await.unwrap();

        let mut concurrent = stale.clone();
        concurrent.page_size = 7;
        store.put(concurrent).await.unwrap();

        let updated = update_transform(&store, &stale, |t| t.enabled = false)
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.page_size, 7);
        assert_eq!(updated.seq_no, 2);
    }
}
