//! Scheduling of transform ticks.
//!
//! Every configured transform becomes one pipeline running a polling loop.
//! Each iteration ingests new lines of the transform's source and then runs
//! one tick through the shared `TransformRunner`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use glacier_core::polling::{IterationResult, PollingProcessor, run_polling_loop};
use glacier_core::{Pipeline, PipelineContext, StorageProvider, StorageProviderRef};

use crate::capability::WriteCapability;
use crate::config::{Config, TransformKey};
use crate::engine::DocumentEngine;
use crate::error::{ConfigError, PipelineError, TransformStoreError};
use crate::ingest::NdjsonSource;
use crate::lock::{InMemoryLockService, TransformLockManager};
use crate::model::Transform;
use crate::runner::{JobContext, TransformRunner, TransformServices};
use crate::sink::StorageDocumentSink;
use crate::store::{StorageMetadataStore, StorageTransformStore, TransformStore, update_transform};

/// A source shared by every transform reading it.
type SharedSource = Arc<Mutex<NdjsonSource>>;

async fn open_storage(uri: &str) -> Result<StorageProviderRef, PipelineError> {
    Ok(Arc::new(StorageProvider::for_url(uri).await?))
}

/// Build the shared services and one pipeline per configured transform.
///
/// Sources are ingested once up front so the first ticks see every
/// document already on disk. Transform records are created or updated
/// from the configuration.
pub async fn build_pipelines(
    config: &Config,
    context: PipelineContext,
) -> Result<Vec<TransformPipeline>, PipelineError> {
    let state = open_storage(&config.state_uri).await?;
    let engine = Arc::new(DocumentEngine::new());

    let mut sources: HashMap<&str, SharedSource> = HashMap::new();
    for (name, source_config) in &config.sources {
        engine.create_index(name, source_config.shards, source_config.mappings.clone());

        let storage = open_storage(&source_config.uri).await?;
        let mut source = NdjsonSource::new(name.clone(), storage, engine.clone());
        let documents = source.poll().await?;
        info!(
            source = %name,
            shards = source_config.shards,
            documents,
            "Loaded source"
        );
        sources.insert(name.as_str(), Arc::new(Mutex::new(source)));
    }

    let write: Arc<dyn WriteCapability> = match &config.output_uri {
        Some(uri) => Arc::new(StorageDocumentSink::new(open_storage(uri).await?)),
        None => engine.clone(),
    };
    let transforms: Arc<dyn TransformStore> = Arc::new(StorageTransformStore::new(state.clone()));
    let holder_id = format!("glacier-{}", Uuid::new_v4());
    let services = TransformServices {
        search: engine.clone(),
        write,
        seq_nos: engine,
        metadata: Arc::new(StorageMetadataStore::new(state)),
        transforms: transforms.clone(),
        locks: TransformLockManager::new(
            Arc::new(InMemoryLockService::new()),
            holder_id,
            context.lock_ttl,
        ),
    };
    let runner = Arc::new(TransformRunner::new(services));

    let now = Utc::now();
    let mut pipelines = Vec::with_capacity(config.transform_count());
    for (key, transform_config) in config.transforms() {
        let source = sources
            .get(transform_config.source.as_str())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSource {
                transform: key.id().to_string(),
                source_name: transform_config.source.clone(),
            })?;

        register_transform(
            transforms.as_ref(),
            transform_config.to_transform(key, now),
        )
        .await?;

        pipelines.push(TransformPipeline {
            key: key.clone(),
            runner: runner.clone(),
            source,
            poll_interval: Duration::from_secs(transform_config.interval_secs),
            context: context.clone(),
        });
    }

    Ok(pipelines)
}

/// Store `desired` unless an identical definition is already stored.
///
/// An existing record keeps its runtime state (enabled flag, metadata id)
/// and only takes the new definition.
pub async fn register_transform(
    store: &dyn TransformStore,
    desired: Transform,
) -> Result<Transform, TransformStoreError> {
    match store.get(&desired.id).await? {
        None => {
            info!(target = %desired.id, enabled = desired.enabled, "Registering transform");
            store.put(desired).await
        }
        Some(existing) if existing.definition_differs(&desired) => {
            info!(target = %desired.id, "Transform definition changed, updating record");
            update_transform(store, &existing, |record| {
                record.source_index = desired.source_index.clone();
                record.target_index = desired.target_index.clone();
                record.data_selection_query = desired.data_selection_query.clone();
                record.groups = desired.groups.clone();
                record.aggregations = desired.aggregations.clone();
                record.page_size = desired.page_size;
                record.continuous = desired.continuous;
                record.schedule = desired.schedule.clone();
                record.owner = desired.owner.clone();
                record.updated_at = desired.updated_at;
            })
            .await
        }
        Some(existing) => Ok(existing),
    }
}

/// One transform's polling loop.
pub struct TransformPipeline {
    pub key: TransformKey,
    runner: Arc<TransformRunner>,
    source: SharedSource,
    poll_interval: Duration,
    context: PipelineContext,
}

impl TransformPipeline {
    async fn execute(self) -> Result<(), PipelineError> {
        let mut processor = TransformProcessor {
            key: self.key.clone(),
            runner: self.runner,
            source: self.source,
            global_semaphore: self.context.global_semaphore.clone(),
        };

        info!(
            target = %self.key,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Transform pipeline initialized"
        );

        run_polling_loop(
            &mut processor,
            self.poll_interval,
            self.context.poll_jitter_secs,
            self.context.shutdown,
            self.key.id(),
            "glacier",
        )
        .await
    }
}

impl Pipeline for TransformPipeline {
    type Key = TransformKey;
    type Error = PipelineError;

    fn key(&self) -> &Self::Key {
        &self.key
    }

    async fn run(self) -> Result<(), Self::Error> {
        self.execute().await
    }
}

struct TransformProcessor {
    key: TransformKey,
    runner: Arc<TransformRunner>,
    source: SharedSource,
    global_semaphore: Option<Arc<Semaphore>>,
}

#[async_trait]
impl PollingProcessor for TransformProcessor {
    type State = JobContext;
    type Error = PipelineError;

    async fn prepare(&mut self, _cold_start: bool) -> Result<Option<Self::State>, Self::Error> {
        let mut source = self.source.lock().await;
        match source.poll().await {
            Ok(0) => {}
            Ok(documents) => debug!(
                target = %self.key,
                source = source.index(),
                documents,
                "Ingested new source documents"
            ),
            // Ingest problems must not stop ticks over data already indexed.
            Err(e) => warn!(target = %self.key, error = %e, "Failed to ingest source"),
        }

        Ok(Some(JobContext::new(self.key.id())))
    }

    async fn process(&mut self, ctx: Self::State) -> Result<IterationResult, Self::Error> {
        let _permit = match &self.global_semaphore {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        let outcome = self.runner.run_job(&ctx).await;
        Ok(if outcome.did_work() {
            IterationResult::ProcessedItems
        } else {
            IterationResult::NoItems
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTransformStore;

    #[tokio::test]
    async fn test_register_creates_missing_record() {
        let store = InMemoryTransformStore::new();
        let stored = register_transform(&store, crate::test_util::transform("t1"))
            .await
            .unwrap();

        assert_eq!(stored.seq_no, 0);
        assert!(store.get("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_keeps_runtime_state() {
        let store = InMemoryTransformStore::new();
        let mut original = crate::test_util::transform("t1");
        original.enabled = false;
        let stored = register_transform(&store, original).await.unwrap();

        // Same definition: untouched.
        let again = register_transform(&store, crate::test_util::transform("t1"))
            .await
            .unwrap();
        assert_eq!(again.seq_no, stored.seq_no);
        assert!(!again.enabled);

        // New definition: updated, still disabled.
        let mut changed = crate::test_util::transform("t1");
        changed.page_size = 10;
        let updated = register_transform(&store, changed).await.unwrap();
        assert_eq!(updated.page_size, 10);
        assert!(!updated.enabled);
        assert_eq!(updated.seq_no, stored.seq_no + 1);
    }
}
