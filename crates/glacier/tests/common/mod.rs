//! Shared fixtures for transform integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};

use glacier::capability::{CompositePage, CompositeRequest, FieldType, SearchCapability};
use glacier::engine::DocumentEngine;
use glacier::error::{LockError, SearchError};
use glacier::lock::{InMemoryLockService, JobLock, LockService, TransformLockManager};
use glacier::model::{
    Aggregation, Group, Metric, Query, Schedule, SeqNo, ShardId, Transform, TransformMetadata,
    UNASSIGNED_PRIMARY_TERM, UNASSIGNED_SEQ_NO,
};
use glacier::runner::{JobContext, TickOutcome, TransformRunner, TransformServices, default_metadata_id};
use glacier::store::{InMemoryMetadataStore, InMemoryTransformStore, TransformStore};

pub const SOURCE: &str = "orders";
pub const TARGET: &str = "orders_by_customer";

/// Continuous transform summing `amount` per `customer`.
pub fn transform(id: &str) -> Transform {
    let now = Utc::now();
    Transform {
        id: id.to_string(),
        metadata_id: None,
        source_index: SOURCE.to_string(),
        target_index: TARGET.to_string(),
        data_selection_query: Query::MatchAll,
        groups: vec![Group::Terms {
            source_field: "customer".to_string(),
            target_field: None,
        }],
        aggregations: vec![Aggregation {
            name: "total".to_string(),
            metric: Metric::Sum,
            field: "amount".to_string(),
        }],
        page_size: 100,
        continuous: true,
        enabled: true,
        enabled_at: Some(now),
        updated_at: now,
        schedule: Schedule { interval_secs: 1 },
        owner: None,
        seq_no: UNASSIGNED_SEQ_NO,
        primary_term: UNASSIGNED_PRIMARY_TERM,
    }
}

pub fn order(customer: &str, amount: f64) -> Map<String, Value> {
    match json!({ "customer": customer, "amount": amount }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Engine, stores and locks of one simulated cluster.
///
/// Runners built from the same harness share everything; `restarted`
/// runners get a fresh lock service, as after a process restart.
pub struct Harness {
    pub engine: Arc<DocumentEngine>,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub transforms: Arc<InMemoryTransformStore>,
    pub locks: Arc<InMemoryLockService>,
}

impl Harness {
    pub fn new(shards: u32) -> Self {
        let engine = DocumentEngine::new();
        let mappings = BTreeMap::from([
            ("customer".to_string(), FieldType::Keyword),
            ("amount".to_string(), FieldType::Double),
        ]);
        engine.create_index(SOURCE, shards, mappings);

        Self {
            engine: Arc::new(engine),
            metadata: Arc::new(InMemoryMetadataStore::new()),
            transforms: Arc::new(InMemoryTransformStore::new()),
            locks: Arc::new(InMemoryLockService::new()),
        }
    }

    pub fn services_with(
        &self,
        search: Arc<dyn SearchCapability>,
        locks: Arc<dyn LockService>,
        holder: &str,
    ) -> TransformServices {
        TransformServices {
            search,
            write: self.engine.clone(),
            seq_nos: self.engine.clone(),
            metadata: self.metadata.clone(),
            transforms: self.transforms.clone(),
            locks: TransformLockManager::new(locks, holder, Duration::from_secs(30)),
        }
    }

    pub fn services(&self) -> TransformServices {
        self.services_with(self.engine.clone(), self.locks.clone(), "node-1")
    }

    pub fn runner(&self) -> TransformRunner {
        TransformRunner::new(self.services())
    }

    /// Runner of a restarted node: same data, locks forgotten.
    pub fn restarted(&self) -> TransformRunner {
        TransformRunner::new(self.services_with(
            self.engine.clone(),
            Arc::new(InMemoryLockService::new()),
            "node-2",
        ))
    }

    pub async fn add(&self, transform: Transform) -> Transform {
        self.transforms.put(transform).await.unwrap()
    }

    pub fn index(&self, customer: &str, amount: f64) -> (ShardId, SeqNo) {
        self.engine
            .index_document(SOURCE, None, order(customer, amount))
            .unwrap()
    }

    /// Latest metadata written for `transform_id`, refreshed or not.
    pub fn metadata_of(&self, transform_id: &str) -> TransformMetadata {
        self.metadata
            .latest(&default_metadata_id(transform_id))
            .expect("metadata written")
    }

    pub async fn record(&self, transform_id: &str) -> Transform {
        self.transforms.get(transform_id).await.unwrap().unwrap()
    }

    /// `customer -> total` of every target document.
    pub fn totals(&self) -> BTreeMap<String, f64> {
        self.engine
            .documents(TARGET)
            .values()
            .map(|doc| {
                (
                    doc["customer"].as_str().unwrap_or_default().to_string(),
                    doc["total"].as_f64().unwrap_or_default(),
                )
            })
            .collect()
    }
}

pub async fn tick(runner: &TransformRunner, id: &str) -> TickOutcome {
    runner.run_job(&JobContext::new(id)).await
}

pub fn shard(number: u32) -> ShardId {
    ShardId::new(SOURCE, number)
}

/// Search that sleeps before every composite search.
pub struct SlowSearch {
    pub inner: Arc<dyn SearchCapability>,
    pub delay: Duration,
}

#[async_trait]
impl SearchCapability for SlowSearch {
    async fn composite_search(
        &self,
        request: CompositeRequest,
    ) -> Result<CompositePage, SearchError> {
        tokio::time::sleep(self.delay).await;
        self.inner.composite_search(request).await
    }

    async fn max_recompute_batch_size(&self, transform: &Transform) -> Result<usize, SearchError> {
        self.inner.max_recompute_batch_size(transform).await
    }

    async fn field_mappings(
        &self,
        index: &str,
    ) -> Result<Option<BTreeMap<String, FieldType>>, SearchError> {
        self.inner.field_mappings(index).await
    }
}

/// Search failing every request scoped to one of `down` while `enabled`.
pub struct ShardFailingSearch {
    pub inner: Arc<dyn SearchCapability>,
    pub down: BTreeSet<ShardId>,
    pub enabled: AtomicBool,
}

impl ShardFailingSearch {
    pub fn new(inner: Arc<dyn SearchCapability>, down: impl IntoIterator<Item = ShardId>) -> Self {
        Self {
            inner,
            down: down.into_iter().collect(),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn recover(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchCapability for ShardFailingSearch {
    async fn composite_search(
        &self,
        request: CompositeRequest,
    ) -> Result<CompositePage, SearchError> {
        if self.enabled.load(Ordering::SeqCst)
            && let Some(shard) = request.shard.as_ref().filter(|s| self.down.contains(*s))
        {
            return Err(SearchError::ShardUnavailable {
                shard: shard.clone(),
            });
        }
        self.inner.composite_search(request).await
    }

    async fn max_recompute_batch_size(&self, transform: &Transform) -> Result<usize, SearchError> {
        self.inner.max_recompute_batch_size(transform).await
    }

    async fn field_mappings(
        &self,
        index: &str,
    ) -> Result<Option<BTreeMap<String, FieldType>>, SearchError> {
        self.inner.field_mappings(index).await
    }
}

/// Lock service whose renewals stop succeeding after `renewals` calls.
pub struct ExpiringLocks {
    pub inner: InMemoryLockService,
    pub renewals_left: AtomicUsize,
}

impl ExpiringLocks {
    pub fn new(renewals: usize) -> Self {
        Self {
            inner: InMemoryLockService::new(),
            renewals_left: AtomicUsize::new(renewals),
        }
    }
}

#[async_trait]
impl LockService for ExpiringLocks {
    async fn acquire(
        &self,
        job_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<JobLock>, LockError> {
        self.inner.acquire(job_id, holder_id, ttl).await
    }

    async fn renew(&self, lock: &JobLock) -> Result<Option<JobLock>, LockError> {
        let granted = self
            .renewals_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if granted {
            self.inner.renew(lock).await
        } else {
            Ok(None)
        }
    }

    async fn release(&self, lock: &JobLock) -> Result<bool, LockError> {
        self.inner.release(lock).await
    }
}
