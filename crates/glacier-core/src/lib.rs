//! glacier-core: shared infrastructure for the glacier transform engine.
//!
//! - `config/` - multi-file YAML loading, env interpolation, global sections
//! - `metrics/` - Prometheus metrics and the `emit!` event pattern
//! - `storage/` - object storage over the local filesystem or memory
//! - `topology/` - running many pipelines with shared shutdown
//! - `polling` - generic polling loop
//! - `signal` - graceful shutdown
//! - `app` - application runner used by `main.rs`

pub mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod signal;
pub mod storage;
pub mod topology;
pub mod tracing;

pub use app::{AppConfig, Application};
pub use config::{CliArgs, ComponentKey, ConfigPath, GlobalConfig, Mergeable, MetricsConfig};
pub use error::{ConfigError, MetricsError, PipelineSetupError, StorageError};
pub use crate::metrics::{
    DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use polling::{IterationResult, PollingProcessor, run_polling_loop};
pub use signal::shutdown_signal;
pub use storage::{StorageProvider, StorageProviderRef};
pub use topology::{Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines};
pub use crate::tracing::init_tracing;
