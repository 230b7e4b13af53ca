//! Internal events emitted by shared infrastructure.
//!
//! Each event struct is a measurable occurrence. Implementations of
//! `InternalEvent` record the corresponding Prometheus metric and a
//! trace-level log line.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    fn emit(self);
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    NotFound,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::NotFound => "not_found",
            RequestStatus::Error => "error",
        }
    }

    /// Classify an object store result.
    pub fn of<T>(result: &Result<T, object_store::Error>) -> Self {
        match result {
            Ok(_) => RequestStatus::Success,
            Err(object_store::Error::NotFound { .. }) => RequestStatus::NotFound,
            Err(_) => RequestStatus::Error,
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "glacier_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted with the latency of a storage request.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "glacier_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Polling iteration events
// ============================================================================

/// Result type for iteration metrics.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
}

impl IterationResultType {
    fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
        }
    }
}

/// Event emitted when a polling iteration completes.
pub struct IterationCompleted {
    pub service: &'static str,
    pub result: IterationResultType,
    /// Transform the iteration ran for.
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(
            service = self.service,
            result = self.result.as_str(),
            target = %self.target,
            "Iteration completed"
        );
        counter!(
            "polling_iterations_total",
            "service" => self.service,
            "result" => self.result.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Time spent in prepare + process of one iteration.
pub struct IterationDuration {
    pub service: &'static str,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        trace!(
            service = self.service,
            duration_ms = self.duration.as_millis(),
            target = %self.target,
            "Iteration duration"
        );
        histogram!(
            "polling_iteration_duration_seconds",
            "service" => self.service,
            "target" => self.target
        )
        .record(self.duration.as_secs_f64());
    }
}
