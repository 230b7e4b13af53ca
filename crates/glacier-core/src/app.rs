//! Application abstraction for reducing main.rs boilerplate.

use std::future::Future;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use crate::config::{CliArgs, ConfigPath, Mergeable};
use crate::error::{ConfigError, PipelineSetupError};
use crate::topology::{Pipeline, PipelineContext, run_pipelines};
use crate::tracing::init_tracing;

/// Application configurations that can be loaded and run.
pub trait AppConfig: Mergeable + Sized {
    /// The pipeline type this config produces.
    type Pipeline: Pipeline;

    /// Human-readable name for components (e.g. "transform").
    const COMPONENT_NAME: &'static str;

    /// Load config from paths with validation.
    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError>;

    /// Build one pipeline per configured component.
    fn create_pipelines(
        &self,
        context: PipelineContext,
    ) -> impl Future<Output = Result<Vec<Self::Pipeline>, PipelineSetupError>>;

    fn log_startup_info(&self);
}

/// Runs the full startup lifecycle for an `AppConfig`.
pub struct Application<C: AppConfig> {
    config: C,
}

impl<C: AppConfig> Application<C> {
    /// Parse args, load config, run pipelines until shutdown.
    pub fn run() -> ExitCode {
        init_tracing();

        let args = CliArgs::parse();
        let paths = args.config_paths();

        if paths.is_empty() {
            eprintln!("Error: no config files or directories specified");
            return ExitCode::FAILURE;
        }

        info!("Loading config from {} source(s)", paths.len());

        match Self::from_paths(&paths) {
            Ok(app) => app.execute(),
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                ExitCode::FAILURE
            }
        }
    }

    /// Load config from paths (useful for testing).
    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config = C::from_paths(paths)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    fn execute(self) -> ExitCode {
        self.config.log_startup_info();

        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "Failed to start tokio runtime");
                return ExitCode::FAILURE;
            }
        };

        let result = runtime.block_on(run_pipelines(
            &Mergeable::metrics(&self.config).address,
            Mergeable::global(&self.config),
            C::COMPONENT_NAME,
            |context| self.config.create_pipelines(context),
        ));

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{} failed: {e}", C::COMPONENT_NAME);
                ExitCode::FAILURE
            }
        }
    }
}
