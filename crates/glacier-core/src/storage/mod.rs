//! Object storage abstraction over the local filesystem and memory.
//!
//! Paths passed to and returned from `StorageProvider` are relative to the
//! configured location.

mod local;
mod url_parser;

pub use local::LocalConfig;
pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn record<T>(operation: StorageOperation, start: Instant, result: &Result<T, object_store::Error>) {
    emit!(StorageRequest {
        operation,
        status: RequestStatus::of(result),
    });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory { key } => Ok(Self::construct_memory(key)),
        }
    }

    /// A fresh, empty in-memory provider.
    pub fn memory() -> Self {
        Self::construct_memory(None)
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;
        record(StorageOperation::Get, start, &result);

        result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Get the contents of an object, `None` if it does not exist.
    pub async fn get_opt(&self, path: &Path) -> Result<Option<Bytes>, StorageError> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write an object, replacing any existing content.
    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put(&path, PutPayload::from(bytes)).await;
        record(StorageOperation::Put, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Write through a temporary object and rename, so readers never see a
    /// partially written object.
    pub async fn atomic_write(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let temp_path = Path::from(format!("{path}.tmp"));
        self.put(&temp_path, bytes).await?;

        let from = self.qualify_path(&temp_path);
        let to = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.rename(&from, &to).await;
        record(StorageOperation::Put, start, &result);

        result.context(ObjectStoreSnafu)
    }

    /// List objects under `prefix`, sorted, relative to the configured base.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<Path>, StorageError> {
        let prefix = Path::from(prefix);
        let full_prefix = self.qualify_path(&prefix).into_owned();
        let base_parts = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let result: Result<Vec<_>, _> = self
            .object_store
            .list(Some(&full_prefix))
            .try_collect()
            .await;
        record(StorageOperation::List, start, &result);

        let mut paths: Vec<Path> = result
            .context(ObjectStoreSnafu)?
            .into_iter()
            .map(|meta| meta.location.parts().skip(base_parts).collect())
            .filter(|path: &Path| !path.as_ref().ends_with(".tmp"))
            .collect();
        paths.sort();
        Ok(paths)
    }
}
