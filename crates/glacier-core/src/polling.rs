//! Generic polling loop trait and runner.
//!
//! Each transform pipeline drives its ticks through `run_polling_loop`.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};
use crate::topology::random_jitter;

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Work was done.
    ProcessedItems,
    /// Nothing to do this iteration.
    NoItems,
    /// Shutdown was requested.
    Shutdown,
}

/// A processor driven by `run_polling_loop`.
#[async_trait]
pub trait PollingProcessor {
    /// State handed from `prepare` to `process`.
    type State: Send;
    type Error: std::error::Error + Send;

    /// Prepare an iteration. `None` means there is nothing to do.
    ///
    /// `cold_start` is true on the first iteration.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Process prepared state.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run `processor` until `shutdown` is cancelled or it returns an error.
///
/// Between iterations the loop sleeps for `poll_interval` plus up to
/// `poll_jitter_secs` of random jitter.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
    name: &str,
    service: &'static str,
) -> Result<(), P::Error> {
    let mut first_iteration = true;

    loop {
        let iteration_start = Instant::now();
        let cold_start = std::mem::replace(&mut first_iteration, false);

        let state = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = name, "Shutdown requested during prepare");
                return Ok(());
            }

            result = processor.prepare(cold_start) => result?,
        };

        // A tick in progress is never interrupted: it always returns
        // normally and leaves metadata at a persist point.
        let result = match state {
            Some(s) => processor.process(s).await?,
            None => IterationResult::NoItems,
        };

        let result_type = match result {
            IterationResult::Shutdown => break,
            IterationResult::NoItems => IterationResultType::NoItems,
            IterationResult::ProcessedItems => IterationResultType::Processed,
        };
        emit!(IterationCompleted {
            service,
            result: result_type,
            target: name.to_string(),
        });
        emit!(IterationDuration {
            service,
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        debug!(
            target = name,
            "Iteration complete, waiting {}ms before next poll",
            sleep_duration.as_millis()
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    struct CountingProcessor {
        prepared: Vec<bool>,
        processed: usize,
        stop_after: usize,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl PollingProcessor for CountingProcessor {
        type State = usize;
        type Error = Infallible;

        async fn prepare(&mut self, cold_start: bool) -> Result<Option<usize>, Infallible> {
            self.prepared.push(cold_start);
            Ok((self.prepared.len() % 2 == 1).then_some(self.prepared.len()))
        }

        async fn process(&mut self, _state: usize) -> Result<IterationResult, Infallible> {
            self.processed += 1;
            if self.processed >= self.stop_after {
                self.shutdown.cancel();
            }
            Ok(IterationResult::ProcessedItems)
        }
    }

    #[tokio::test]
    async fn test_loop_runs_until_shutdown() {
        crate::metrics::init_test();
        let shutdown = CancellationToken::new();
        let mut processor = CountingProcessor {
            prepared: Vec::new(),
            processed: 0,
            stop_after: 2,
            shutdown: shutdown.clone(),
        };

        run_polling_loop(
            &mut processor,
            Duration::from_millis(1),
            0,
            shutdown,
            "test",
            "glacier",
        )
        .await
        .unwrap();

        assert_eq!(processor.processed, 2);
        assert_eq!(processor.prepared, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_nothing() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut processor = CountingProcessor {
            prepared: Vec::new(),
            processed: 0,
            stop_after: 1,
            shutdown: shutdown.clone(),
        };

        run_polling_loop(&mut processor, Duration::ZERO, 0, shutdown, "test", "glacier")
            .await
            .unwrap();

        assert!(processor.prepared.is_empty());
    }
}
