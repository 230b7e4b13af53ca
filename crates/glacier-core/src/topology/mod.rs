//! Orchestration primitives for running many pipelines in one process.

mod pipeline;

pub use pipeline::{Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines};
