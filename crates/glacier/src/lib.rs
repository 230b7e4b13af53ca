//! Glacier: continuous transforms over sharded, sequence-numbered indices.
//!
//! A transform groups source documents into buckets and writes one
//! aggregated document per bucket to a target index. In continuous mode
//! each tick only recomputes the buckets touched by documents written
//! since the last committed per-shard checkpoint.
//!
//! - `runner` - one tick: lock, discover, recompute, index, commit
//! - `checkpoint` / `discovery` / `recompute` / `indexer` - the tick's stages
//! - `store` - transform records and their execution metadata
//! - `lock` - leases that keep ticks of one transform exclusive
//! - `engine` / `ingest` / `sink` - in-process document engine and its I/O
//! - `pipeline` - one polling loop per configured transform

pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod ingest;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod recompute;
pub mod runner;
pub mod search;
pub mod sink;
pub mod store;
pub mod validate;

pub use config::{Config, TransformKey};
pub use control::{start_transform, stop_transform};
pub use engine::DocumentEngine;
pub use error::{PipelineError, TransformError};
pub use lock::{InMemoryLockService, LockService, TransformLockManager};
pub use pipeline::{TransformPipeline, build_pipelines};
pub use runner::{JobContext, SkipReason, TickOutcome, TransformRunner, TransformServices};

pub use glacier_core::{StorageProvider, StorageProviderRef, init_metrics, shutdown_signal};
