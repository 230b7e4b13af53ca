//! Error types for the glacier transform engine.
//!
//! Capability errors (`SearchError`, `IndexError`) and store errors are
//! wrapped by `TransformError`, the error of a single tick. A tick never
//! returns its error: the runner records it as the failure reason.

use snafu::prelude::*;

pub use glacier_core::error::{ConfigError, PipelineSetupError, StorageError};

use crate::model::ShardId;

/// Errors from the search capability.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SearchError {
    /// One shard could not serve a shard-scoped request.
    #[snafu(display("Shard {shard} is unavailable"))]
    ShardUnavailable { shard: ShardId },

    #[snafu(display("Index [{index}] does not exist"))]
    IndexNotFound { index: String },

    /// Query exceeds the backend's clause limit.
    #[snafu(display("Query has {count} clauses, more than the maximum of {max}"))]
    TooManyClauses { count: usize, max: usize },

    #[snafu(display("Invalid search request: {message}"))]
    InvalidRequest { message: String },
}

impl SearchError {
    /// The shard this error is scoped to, if it only affects one shard.
    pub fn failed_shard(&self) -> Option<&ShardId> {
        match self {
            SearchError::ShardUnavailable { shard } => Some(shard),
            _ => None,
        }
    }
}

/// Errors from the write capability.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IndexError {
    /// Some documents of a bulk request failed; the batch counts as failed.
    #[snafu(display("Failed to index {} document(s): {}", failures.len(), failures.join("; ")))]
    BulkFailures { failures: Vec<String> },

    #[snafu(display("Target index [{index}] is not writable"))]
    TargetUnavailable { index: String },
}

/// Errors from the metadata store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetadataError {
    #[snafu(display("Metadata storage failed: {source}"))]
    MetadataStorage { source: StorageError },

    #[snafu(display("Failed to encode metadata {id}: {source}"))]
    MetadataEncode {
        id: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to decode metadata {id}: {source}"))]
    MetadataDecode {
        id: String,
        source: serde_json::Error,
    },
}

/// Errors from the transform (job record) store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformStoreError {
    #[snafu(display("Transform storage failed: {source}"))]
    TransformStorage { source: StorageError },

    #[snafu(display("Failed to encode transform {id}: {source}"))]
    TransformEncode {
        id: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to decode transform {id}: {source}"))]
    TransformDecode {
        id: String,
        source: serde_json::Error,
    },

    #[snafu(display("Transform {id} not found"))]
    TransformNotFound { id: String },

    /// The stored record changed since it was read.
    #[snafu(display(
        "Version conflict on transform {id}: expected seq_no {expected}, found {actual}"
    ))]
    VersionConflict {
        id: String,
        expected: i64,
        actual: i64,
    },
}

impl TransformStoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, TransformStoreError::VersionConflict { .. })
    }
}

/// Errors from a lock backend.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LockError {
    #[snafu(display("Lock backend unavailable: {message}"))]
    LockBackend { message: String },
}

/// Error of a single tick.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    #[snafu(display("{source}"))]
    Search { source: SearchError },

    #[snafu(display("{source}"))]
    Index { source: IndexError },

    #[snafu(display("{source}"))]
    Metadata { source: MetadataError },

    #[snafu(display("{source}"))]
    Store { source: TransformStoreError },

    /// The execution lock could not be renewed.
    #[snafu(display("Lost lock on transform {transform_id}"))]
    LockLost { transform_id: String },
}

impl TransformError {
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, TransformError::LockLost { .. })
    }
}

impl From<SearchError> for TransformError {
    fn from(source: SearchError) -> Self {
        TransformError::Search { source }
    }
}

impl From<IndexError> for TransformError {
    fn from(source: IndexError) -> Self {
        TransformError::Index { source }
    }
}

impl From<MetadataError> for TransformError {
    fn from(source: MetadataError) -> Self {
        TransformError::Metadata { source }
    }
}

impl From<TransformStoreError> for TransformError {
    fn from(source: TransformStoreError) -> Self {
        TransformError::Store { source }
    }
}

/// Errors from start/stop control operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ControlError {
    #[snafu(display("Control operation on {id} failed: {source}"))]
    ControlStore {
        id: String,
        source: TransformStoreError,
    },

    #[snafu(display("Control operation on {id} failed: {source}"))]
    ControlMetadata { id: String, source: MetadataError },

    #[snafu(display("Transform {id} not found"))]
    ControlNotFound { id: String },
}

/// Errors from document ingestion.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    #[snafu(display("Failed to read source {source_name}: {source}"))]
    IngestStorage {
        source_name: String,
        source: StorageError,
    },

    #[snafu(display("Invalid document at {path}:{line}: {source}"))]
    ParseDocument {
        path: String,
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("Document at {path}:{line} is not a JSON object"))]
    NotAnObject { path: String, line: usize },

    #[snafu(display("Source index [{index}] does not exist"))]
    UnknownIndex { index: String },
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("Transform store error: {source}"))]
    TransformStore { source: TransformStoreError },

    #[snafu(display("Ingest error: {source}"))]
    Ingest { source: IngestError },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<TransformStoreError> for PipelineError {
    fn from(source: TransformStoreError) -> Self {
        PipelineError::TransformStore { source }
    }
}

impl From<IngestError> for PipelineError {
    fn from(source: IngestError) -> Self {
        PipelineError::Ingest { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_shard_only_for_shard_errors() {
        let err = SearchError::ShardUnavailable {
            shard: ShardId::new("orders", 1),
        };
        assert_eq!(err.failed_shard(), Some(&ShardId::new("orders", 1)));

        let err = SearchError::IndexNotFound {
            index: "orders".to_string(),
        };
        assert!(err.failed_shard().is_none());
    }

    #[test]
    fn test_tick_error_message_is_the_cause() {
        let err: TransformError = IndexError::BulkFailures {
            failures: vec!["doc a: mapping conflict".to_string()],
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Failed to index 1 document(s): doc a: mapping conflict"
        );
        assert!(!err.is_lock_lost());

        let err = TransformError::LockLost {
            transform_id: "t1".to_string(),
        };
        assert!(err.is_lock_lost());
    }
}
