//! Pipeline orchestration primitives.
//!
//! Runs many pipelines concurrently with jittered starts and shared
//! shutdown handling.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::GlobalConfig;
use crate::error::{AddressParseSnafu, MetricsSnafu, PipelineSetupError};
use crate::signal::shutdown_signal;

/// Shared resources for pipeline execution.
#[derive(Clone)]
pub struct PipelineContext {
    /// Cross-pipeline limit on concurrently executing iterations.
    pub global_semaphore: Option<Arc<Semaphore>>,
    /// Maximum jitter in seconds to add to poll intervals.
    pub poll_jitter_secs: u64,
    /// Lease duration for per-pipeline locks.
    pub lock_ttl: Duration,
    /// Cancellation token for graceful shutdown.
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    pub fn new(global: &GlobalConfig, shutdown: CancellationToken) -> Self {
        Self {
            global_semaphore: global
                .total_concurrency
                .map(|n| Arc::new(Semaphore::new(n))),
            poll_jitter_secs: global.poll_jitter_secs,
            lock_ttl: Duration::from_secs(global.lock_ttl_secs),
            shutdown,
        }
    }
}

/// A self-contained unit the runner can spawn.
pub trait Pipeline: Send + 'static {
    type Key: Clone + Display + Send + 'static;
    type Error: std::error::Error + Send + 'static;

    fn key(&self) -> &Self::Key;

    /// Run this pipeline to completion.
    fn run(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Runs multiple pipelines with shared shutdown handling.
pub struct PipelineRunner<P: Pipeline> {
    pipelines: Vec<P>,
    shutdown: CancellationToken,
    poll_jitter_secs: u64,
    typetag: &'static str,
}

impl<P: Pipeline> PipelineRunner<P> {
    pub fn new(
        pipelines: Vec<P>,
        shutdown: CancellationToken,
        poll_jitter_secs: u64,
        typetag: &'static str,
    ) -> Self {
        Self {
            pipelines,
            shutdown,
            poll_jitter_secs,
            typetag,
        }
    }

    /// Cancel the shared token on SIGINT/SIGTERM/SIGQUIT.
    pub fn spawn_shutdown_handler(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    /// Run all pipelines to completion.
    #[allow(clippy::type_complexity)]
    pub async fn run(self) {
        let mut handles: JoinSet<(P::Key, Result<(), P::Error>)> = JoinSet::new();
        let typetag = self.typetag;

        for pipeline in self.pipelines {
            let shutdown = self.shutdown.clone();
            let key = pipeline.key().clone();
            let start_jitter = random_jitter(self.poll_jitter_secs);

            handles.spawn(async move {
                if !start_jitter.is_zero() {
                    info!(
                        target = %key,
                        jitter_ms = start_jitter.as_millis() as u64,
                        "Delaying {} start for jitter", typetag
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        info!(target = %key, "Shutdown requested during jitter delay");
                        return (key, Ok(()));
                    }
                }

                let result = pipeline.run().await;
                (key, result)
            });
        }

        info!("Spawned {} {} tasks", handles.len(), typetag);

        while let Some(result) = handles.join_next().await {
            match result {
                Ok((key, Ok(()))) => info!(target = %key, "{} completed", typetag),
                Ok((key, Err(e))) => error!(target = %key, error = %e, "{} failed", typetag),
                Err(e) => error!(error = %e, "{} task panicked", typetag),
            }
        }

        info!("All {}s complete", typetag);
    }
}

/// Initialize metrics, build pipelines and run them until shutdown.
///
/// `create_pipelines` is async so pipelines can share services that need
/// I/O to construct.
pub async fn run_pipelines<P, F, Fut>(
    metrics_address: &str,
    global: &GlobalConfig,
    typetag: &'static str,
    create_pipelines: F,
) -> Result<(), PipelineSetupError>
where
    P: Pipeline,
    F: FnOnce(PipelineContext) -> Fut,
    Fut: Future<Output = Result<Vec<P>, PipelineSetupError>>,
{
    let addr = metrics_address.parse().context(AddressParseSnafu)?;
    crate::metrics::init_global(addr).context(MetricsSnafu)?;

    let shutdown = CancellationToken::new();
    let context = PipelineContext::new(global, shutdown.clone());
    let pipelines = create_pipelines(context).await?;

    let runner = PipelineRunner::new(pipelines, shutdown, global.poll_jitter_secs, typetag);
    runner.spawn_shutdown_handler();
    runner.run().await;

    Ok(())
}

/// Random duration in `[0, max_secs)`.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_random_jitter_zero() {
        assert_eq!(random_jitter(0), Duration::ZERO);
    }

    #[test]
    fn test_random_jitter_within_bounds() {
        for _ in 0..100 {
            assert!(random_jitter(3) < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_context_from_global() {
        let global = GlobalConfig {
            total_concurrency: Some(2),
            poll_jitter_secs: 4,
            lock_ttl_secs: 30,
        };
        let ctx = PipelineContext::new(&global, CancellationToken::new());

        assert_eq!(ctx.global_semaphore.unwrap().available_permits(), 2);
        assert_eq!(ctx.poll_jitter_secs, 4);
        assert_eq!(ctx.lock_ttl, Duration::from_secs(30));
    }

    #[derive(Debug, snafu::Snafu)]
    #[snafu(display("boom"))]
    struct Boom;

    struct CountingPipeline {
        key: String,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    impl Pipeline for CountingPipeline {
        type Key = String;
        type Error = Boom;

        fn key(&self) -> &String {
            &self.key
        }

        async fn run(self) -> Result<(), Boom> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail { Err(Boom) } else { Ok(()) }
        }
    }

    #[tokio::test]
    async fn test_runner_runs_every_pipeline() {
        let runs = Arc::new(AtomicUsize::new(0));
        let pipelines = (0..3)
            .map(|i| CountingPipeline {
                key: format!("t{i}"),
                fail: i == 1,
                runs: runs.clone(),
            })
            .collect();

        PipelineRunner::new(pipelines, CancellationToken::new(), 0, "transform")
            .run()
            .await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
