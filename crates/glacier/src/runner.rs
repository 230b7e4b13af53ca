//! Execution of one transform tick.
//!
//! A tick acquires the transform's lock, loads its metadata and advances it
//! by units of work (one discovery page, one recompute batch, one
//! single-shot page). Metadata is persisted and the lock renewed after each
//! unit, so an interrupted tick resumes at the last persist point.
//!
//! `TransformRunner::run_job` never returns an error. Failures are recorded
//! in the metadata and disable the transform; losing the lock stops the
//! tick without any further write.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use glacier_core::emit;
use tracing::{debug, error, info, warn};

use crate::capability::{SearchCapability, SequenceNumberAuthority, WriteCapability};
use crate::checkpoint::{CheckpointTracker, committed_checkpoints, shard_delta};
use crate::discovery::BucketDiscovery;
use crate::error::{TransformError, TransformStoreError};
use crate::indexer::TransformIndexer;
use crate::lock::{JobLock, TransformLockManager};
use crate::metrics::events::{
    CheckpointCommitted, LockContended, LockLost, PagesProcessed, RecomputeBatchCompleted,
    ShardsFailed, TickCompleted, TickOutcomeKind,
};
use crate::model::{
    ContinuousPass, ContinuousStats, PassPhase, Transform, TransformMetadata, TransformStats,
    TransformStatus,
};
use crate::recompute::{BucketRecompute, batches};
use crate::search::TransformSearchService;
use crate::store::{MetadataStore, TransformStore, update_transform};
use crate::validate::TransformValidator;

/// Everything a tick talks to, built once and shared by every transform.
#[derive(Clone)]
pub struct TransformServices {
    pub search: Arc<dyn SearchCapability>,
    pub write: Arc<dyn WriteCapability>,
    pub seq_nos: Arc<dyn SequenceNumberAuthority>,
    pub metadata: Arc<dyn MetadataStore>,
    pub transforms: Arc<dyn TransformStore>,
    pub locks: TransformLockManager,
}

/// Trigger of one tick.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub run_id: Uuid,
    pub triggered_at: DateTime<Utc>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            run_id: Uuid::new_v4(),
            triggered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Disabled,
    /// Another attempt holds the lock.
    LockUnavailable,
    Stopped,
    Finished,
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped(SkipReason),
    Completed { status: TransformStatus },
    Failed { reason: String },
    /// The lock could not be renewed and the tick stopped writing.
    LockLost,
}

impl TickOutcome {
    pub fn kind(&self) -> TickOutcomeKind {
        match self {
            TickOutcome::Skipped(_) => TickOutcomeKind::Skipped,
            TickOutcome::Completed { .. } => TickOutcomeKind::Completed,
            TickOutcome::Failed { .. } => TickOutcomeKind::Failed,
            TickOutcome::LockLost => TickOutcomeKind::LockLost,
        }
    }

    /// Whether the tick did any work.
    pub fn did_work(&self) -> bool {
        !matches!(self, TickOutcome::Skipped(_))
    }
}

/// Id of the metadata record of a transform that has none yet.
pub fn default_metadata_id(transform_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, transform_id.as_bytes()).to_string()
}

pub struct TransformRunner {
    services: TransformServices,
    checkpoints: CheckpointTracker,
    discovery: BucketDiscovery,
    recompute: BucketRecompute,
    indexer: TransformIndexer,
    validator: TransformValidator,
}

impl TransformRunner {
    pub fn new(services: TransformServices) -> Self {
        let search = TransformSearchService::new(services.search.clone());
        Self {
            checkpoints: CheckpointTracker::new(services.seq_nos.clone()),
            discovery: BucketDiscovery::new(search.clone()),
            recompute: BucketRecompute::new(search),
            indexer: TransformIndexer::new(services.write.clone()),
            validator: TransformValidator::new(services.search.clone()),
            services,
        }
    }

    pub fn services(&self) -> &TransformServices {
        &self.services
    }

    /// Run one tick of the transform `ctx.job_id`.
    pub async fn run_job(&self, ctx: &JobContext) -> TickOutcome {
        let start = Instant::now();
        debug!(target = %ctx.job_id, run_id = %ctx.run_id, "Tick started");

        let outcome = self.tick(ctx).await;

        emit!(TickCompleted {
            transform: ctx.job_id.clone(),
            outcome: outcome.kind(),
            duration: start.elapsed(),
        });
        debug!(target = %ctx.job_id, run_id = %ctx.run_id, outcome = ?outcome, "Tick finished");
        outcome
    }

    async fn tick(&self, ctx: &JobContext) -> TickOutcome {
        let mut transform = match self.services.transforms.get(&ctx.job_id).await {
            Ok(Some(transform)) => transform,
            Ok(None) => {
                warn!(target = %ctx.job_id, "Transform not found, skipping tick");
                return TickOutcome::Skipped(SkipReason::NotFound);
            }
            Err(e) => {
                error!(target = %ctx.job_id, error = %e, "Failed to read transform");
                return TickOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        if !transform.enabled {
            debug!(target = %transform.id, "Transform disabled, skipping tick");
            return TickOutcome::Skipped(SkipReason::Disabled);
        }

        let Some(lock) = self.services.locks.acquire(&transform).await else {
            warn!(target = %transform.id, "Could not acquire lock, skipping tick");
            emit!(LockContended {
                transform: transform.id.clone(),
            });
            return TickOutcome::Skipped(SkipReason::LockUnavailable);
        };

        let metadata = match self.load_metadata(&mut transform).await {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(target = %transform.id, error = %e, "Failed to load metadata");
                self.services.locks.release(&lock).await;
                return TickOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        if metadata.is_halted() {
            info!(
                target = %transform.id,
                status = %metadata.status,
                "Transform is halted, skipping tick"
            );
            self.services.locks.release(&lock).await;
            let reason = match metadata.status {
                TransformStatus::Finished => SkipReason::Finished,
                _ => SkipReason::Stopped,
            };
            return TickOutcome::Skipped(reason);
        }

        let mut execution = Execution {
            runner: self,
            transform,
            lock,
            metadata,
        };
        let result = execution.run().await;
        execution.finish(result).await
    }

    /// Read the transform's metadata, creating it on the first run.
    async fn load_metadata(
        &self,
        transform: &mut Transform,
    ) -> Result<TransformMetadata, TransformError> {
        let store = &self.services.metadata;

        if let Some(id) = &transform.metadata_id
            && let Some(metadata) = store.read(id).await?
        {
            return Ok(metadata);
        }

        let id = transform
            .metadata_id
            .clone()
            .unwrap_or_else(|| default_metadata_id(&transform.id));
        let metadata = match store.read(&id).await? {
            Some(existing) => existing,
            None => {
                info!(target = %transform.id, metadata_id = %id, "Creating metadata");
                let initial = TransformMetadata::new(id.clone(), transform.id.clone(), Utc::now());
                store.write(initial, true).await?
            }
        };

        if transform.metadata_id.as_deref() != Some(id.as_str()) {
            *transform = update_transform(self.services.transforms.as_ref(), transform, |t| {
                t.metadata_id = Some(id.clone());
            })
            .await?;
        }

        Ok(metadata)
    }
}

/// State of one locked tick.
struct Execution<'a> {
    runner: &'a TransformRunner,
    transform: Transform,
    lock: JobLock,
    metadata: TransformMetadata,
}

impl Execution<'_> {
    async fn run(&mut self) -> Result<(), TransformError> {
        if self.metadata.status == TransformStatus::Failed {
            info!(
                target = %self.transform.id,
                reason = ?self.metadata.failure_reason,
                "Retrying failed transform"
            );
            self.metadata.status = TransformStatus::Init;
            self.metadata.failure_reason = None;
        }

        let validation = self.runner.validator.validate(&self.transform).await?;
        if !validation.is_valid() {
            self.metadata.fail(validation.failure_reason());
            return Ok(());
        }

        if self.transform.continuous {
            self.run_continuous().await
        } else {
            self.run_single_shot().await
        }
    }

    async fn run_continuous(&mut self) -> Result<(), TransformError> {
        if self.metadata.pass.is_none() {
            self.start_pass().await?;
        } else {
            info!(target = %self.transform.id, "Resuming continuous pass");
        }

        self.discover().await?;
        self.recompute().await?;
        self.commit();
        Ok(())
    }

    /// Capture checkpoints and persist the new pass.
    async fn start_pass(&mut self) -> Result<(), TransformError> {
        let snapshot = self
            .runner
            .checkpoints
            .current_global_checkpoints(&self.transform.source_index)
            .await?;
        let shards = shard_delta(&self.metadata.shard_checkpoints, &snapshot.checkpoints);

        if !snapshot.failed.is_empty() {
            emit!(ShardsFailed {
                transform: self.transform.id.clone(),
                count: snapshot.failed.len() as u64,
            });
        }
        info!(
            target = %self.transform.id,
            shards = shards.len(),
            failed = snapshot.failed.len(),
            "Starting continuous pass"
        );

        let has_work = !shards.is_empty();
        self.metadata.pass = Some(ContinuousPass::new(
            snapshot.captured_at,
            snapshot.checkpoints,
            snapshot.failed,
            shards,
        ));
        self.metadata.after_key = None;
        self.metadata.status = TransformStatus::Started;

        if has_work {
            self.persist().await?;
        }
        Ok(())
    }

    /// Page through every shard of the pass, collecting modified buckets.
    async fn discover(&mut self) -> Result<(), TransformError> {
        loop {
            let Some(shard) = self.pass().and_then(|p| p.current_shard()).cloned() else {
                break;
            };
            let after_key = self.metadata.after_key.clone();

            let page = match self
                .runner
                .discovery
                .discover_page(&self.transform, &shard, after_key)
                .await
            {
                Ok(page) => Some(page),
                Err(e) if e.failed_shard().is_some() => {
                    warn!(
                        target = %self.transform.id,
                        shard = %shard.shard,
                        error = %e,
                        "Shard failed during discovery, excluding it from this pass"
                    );
                    emit!(ShardsFailed {
                        transform: self.transform.id.clone(),
                        count: 1,
                    });
                    None
                }
                Err(e) => return Err(e.into()),
            };

            let Some(pass) = self.metadata.pass.as_mut() else {
                break;
            };
            let shard_done = match page {
                Some(page) => {
                    self.metadata.stats.merge(&TransformStats {
                        pages_processed: 1,
                        search_time_ms: page.took.as_millis() as u64,
                        ..Default::default()
                    });
                    pass.modified_buckets.extend(page.buckets);
                    self.metadata.after_key = page.after_key;
                    emit!(PagesProcessed {
                        transform: self.transform.id.clone(),
                        count: 1,
                    });
                    self.metadata.after_key.is_none()
                }
                None => {
                    pass.failed_shards.insert(shard.shard.clone());
                    self.metadata.after_key = None;
                    true
                }
            };
            if shard_done {
                pass.shard_cursor += 1;
                if pass.shard_cursor >= pass.shards.len() {
                    pass.phase = PassPhase::Recomputing;
                }
            }

            self.persist().await?;
        }

        if let Some(pass) = self.metadata.pass.as_mut() {
            pass.phase = PassPhase::Recomputing;
        }
        Ok(())
    }

    /// Recompute the modified buckets batch by batch.
    async fn recompute(&mut self) -> Result<(), TransformError> {
        if self.pass().is_none_or(|p| p.modified_buckets.is_empty()) {
            return Ok(());
        }

        let batch_size = self.runner.recompute.batch_size(&self.transform).await?;
        let pending = self
            .pass()
            .map(|p| batches(&p.modified_buckets, batch_size))
            .unwrap_or_default();
        debug!(
            target = %self.transform.id,
            batch_size,
            batches = pending.len(),
            "Recomputing modified buckets"
        );

        for keys in pending {
            let batch = self
                .runner
                .recompute
                .recompute_batch(&self.transform, &keys)
                .await?;
            let indexed = self
                .runner
                .indexer
                .index(&self.transform, &batch.buckets)
                .await?;

            self.metadata.stats.merge(&TransformStats {
                documents_processed: batch.doc_count(),
                documents_indexed: indexed.documents,
                index_time_ms: indexed.took.as_millis() as u64,
                search_time_ms: batch.took.as_millis() as u64,
                ..Default::default()
            });

            let remaining = match self.metadata.pass.as_mut() {
                Some(pass) => {
                    for key in &keys {
                        pass.modified_buckets.remove(key);
                    }
                    pass.modified_buckets.len()
                }
                None => 0,
            };

            self.persist().await?;
            emit!(RecomputeBatchCompleted {
                transform: self.transform.id.clone(),
                buckets: keys.len() as u64,
                remaining: remaining as u64,
            });
        }
        Ok(())
    }

    /// Fold the finished pass into the committed checkpoints.
    fn commit(&mut self) {
        let Some(pass) = self.metadata.pass.take() else {
            return;
        };

        self.metadata.shard_checkpoints = committed_checkpoints(
            &self.metadata.shard_checkpoints,
            &pass.checkpoints,
            &pass.failed_shards,
        );
        self.metadata.continuous_stats = Some(ContinuousStats {
            last_timestamp: Some(pass.captured_at),
        });
        self.metadata.after_key = None;

        info!(
            target = %self.transform.id,
            shards = self.metadata.shard_checkpoints.len(),
            failed = pass.failed_shards.len(),
            "Committed continuous pass"
        );
        emit!(CheckpointCommitted {
            transform: self.transform.id.clone(),
            total_seq_no: self.metadata.shard_checkpoints.values().sum(),
        });
    }

    /// Aggregate the whole source page by page until the cursor runs out.
    async fn run_single_shot(&mut self) -> Result<(), TransformError> {
        self.metadata.status = TransformStatus::Started;

        loop {
            let page = self
                .runner
                .recompute
                .full_pass_page(&self.transform, self.metadata.after_key.clone())
                .await?;
            let indexed = self
                .runner
                .indexer
                .index(&self.transform, &page.buckets)
                .await?;

            self.metadata.stats.merge(&TransformStats {
                pages_processed: 1,
                documents_processed: page.buckets.iter().map(|b| b.doc_count).sum(),
                documents_indexed: indexed.documents,
                index_time_ms: indexed.took.as_millis() as u64,
                search_time_ms: page.took.as_millis() as u64,
            });
            emit!(PagesProcessed {
                transform: self.transform.id.clone(),
                count: 1,
            });

            self.metadata.after_key = page.after_key;
            if self.metadata.after_key.is_none() {
                self.metadata.status = TransformStatus::Finished;
                return Ok(());
            }
            self.persist().await?;
        }
    }

    fn pass(&self) -> Option<&ContinuousPass> {
        self.metadata.pass.as_ref()
    }

    /// Persist the metadata and renew the lock.
    ///
    /// Forced, so the next tick reads this progress even if this one dies.
    async fn persist(&mut self) -> Result<(), TransformError> {
        self.write_metadata().await?;
        self.renew()
            .await
            .ok_or_else(|| TransformError::LockLost {
                transform_id: self.transform.id.clone(),
            })
    }

    async fn write_metadata(&mut self) -> Result<(), TransformError> {
        self.metadata.last_updated_at = Utc::now();
        self.metadata = self
            .runner
            .services
            .metadata
            .write(self.metadata.clone(), true)
            .await?;
        Ok(())
    }

    async fn renew(&mut self) -> Option<()> {
        let renewed = self.runner.services.locks.renew(&self.lock).await?;
        self.lock = renewed;
        Some(())
    }

    /// Record the result of the tick and apply terminal transitions.
    async fn finish(mut self, result: Result<(), TransformError>) -> TickOutcome {
        match result {
            Ok(()) => {}
            Err(e) if e.is_lock_lost() => return self.lock_lost(),
            Err(e) => {
                error!(target = %self.transform.id, error = %e, "Transform failed");
                self.metadata.fail(e.to_string());
            }
        }

        if let Err(e) = self.write_metadata().await {
            error!(target = %self.transform.id, error = %e, "Failed to write metadata");
            self.runner.services.locks.release(&self.lock).await;
            return TickOutcome::Failed {
                reason: e.to_string(),
            };
        }

        if self.renew().await.is_none() {
            return self.lock_lost();
        }

        let status = self.metadata.status;
        let terminal = status == TransformStatus::Failed
            || (status == TransformStatus::Finished && !self.transform.continuous);
        if terminal {
            self.disable().await;
        }
        self.runner.services.locks.release(&self.lock).await;

        match (status, &self.metadata.failure_reason) {
            (TransformStatus::Failed, reason) => {
                let reason = reason.clone().unwrap_or_default();
                error!(target = %self.transform.id, reason = %reason, "Transform marked failed");
                TickOutcome::Failed { reason }
            }
            _ => TickOutcome::Completed { status },
        }
    }

    fn lock_lost(&self) -> TickOutcome {
        error!(
            target = %self.transform.id,
            "Lost lock, stopping without further writes"
        );
        emit!(LockLost {
            transform: self.transform.id.clone(),
        });
        TickOutcome::LockLost
    }

    async fn disable(&mut self) {
        let now = Utc::now();
        let result: Result<Transform, TransformStoreError> =
            update_transform(self.runner.services.transforms.as_ref(), &self.transform, |t| {
                t.disable(now)
            })
            .await;

        match result {
            Ok(transform) => {
                info!(
                    target = %transform.id,
                    status = %self.metadata.status,
                    "Disabled transform"
                );
                self.transform = transform;
            }
            Err(e) => {
                error!(target = %self.transform.id, error = %e, "Failed to disable transform");
            }
        }
    }
}
