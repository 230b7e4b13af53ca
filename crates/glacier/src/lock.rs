//! Per-transform execution locks.
//!
//! A lock is a lease: it is held by one execution attempt until it expires
//! or is released. Each acquisition gets a fresh sequence number that acts
//! as a fencing token, so a holder whose lease expired and was re-acquired
//! by someone else can never renew or release the new lease.
//!
//! Failing to acquire is not an error, it means "skip this tick". Failing
//! to renew means the lock was lost and the attempt must stop writing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::model::Transform;

/// A held lease on a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLock {
    pub job_id: String,
    pub holder_id: String,
    /// Fencing token, increasing across acquisitions.
    pub sequence_number: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Instant,
    pub ttl: Duration,
}

impl JobLock {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Remaining lease time, zero if expired.
    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Lock backend.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire the lock on `job_id`, or `None` if someone else holds it.
    async fn acquire(
        &self,
        job_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<JobLock>, LockError>;

    /// Extend `lock`, or `None` if it is no longer held by its holder.
    async fn renew(&self, lock: &JobLock) -> Result<Option<JobLock>, LockError>;

    /// Release `lock`. Returns false if it was not held anymore.
    async fn release(&self, lock: &JobLock) -> Result<bool, LockError>;
}

/// Process-local lock service.
#[derive(Default)]
pub struct InMemoryLockService {
    locks: Mutex<HashMap<String, JobLock>>,
    sequence: AtomicU64,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `job_id`, if the lease is live.
    pub async fn holder(&self, job_id: &str) -> Option<JobLock> {
        let locks = self.locks.lock().await;
        locks.get(job_id).filter(|l| !l.is_expired()).cloned()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        job_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<JobLock>, LockError> {
        let mut locks = self.locks.lock().await;

        if let Some(existing) = locks.get(job_id)
            && !existing.is_expired()
        {
            debug!(
                job_id,
                holder = %existing.holder_id,
                remaining_ms = existing.remaining_ttl().as_millis() as u64,
                "Lock held"
            );
            return Ok(None);
        }

        let lock = JobLock {
            job_id: job_id.to_string(),
            holder_id: holder_id.to_string(),
            sequence_number: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            acquired_at: Utc::now(),
            expires_at: Instant::now() + ttl,
            ttl,
        };
        locks.insert(job_id.to_string(), lock.clone());
        Ok(Some(lock))
    }

    async fn renew(&self, lock: &JobLock) -> Result<Option<JobLock>, LockError> {
        let mut locks = self.locks.lock().await;

        match locks.get_mut(&lock.job_id) {
            Some(current)
                if current.sequence_number == lock.sequence_number && !current.is_expired() =>
            {
                current.expires_at = Instant::now() + current.ttl;
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lock: &JobLock) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;

        let held = locks
            .get(&lock.job_id)
            .is_some_and(|current| current.sequence_number == lock.sequence_number);
        if held {
            locks.remove(&lock.job_id);
        }
        Ok(held)
    }
}

/// Lock operations for the runner.
///
/// Backend errors are logged and treated like an unavailable lock: the
/// tick is skipped, or, on renewal, the lock counts as lost.
#[derive(Clone)]
pub struct TransformLockManager {
    service: Arc<dyn LockService>,
    holder_id: String,
    ttl: Duration,
}

impl TransformLockManager {
    pub fn new(service: Arc<dyn LockService>, holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            service,
            holder_id: holder_id.into(),
            ttl,
        }
    }

    pub async fn acquire(&self, transform: &Transform) -> Option<JobLock> {
        match self
            .service
            .acquire(&transform.id, &self.holder_id, self.ttl)
            .await
        {
            Ok(lock) => lock,
            Err(e) => {
                warn!(target = %transform.id, error = %e, "Failed to acquire lock");
                None
            }
        }
    }

    pub async fn renew(&self, lock: &JobLock) -> Option<JobLock> {
        match self.service.renew(lock).await {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(target = %lock.job_id, error = %e, "Failed to renew lock");
                None
            }
        }
    }

    pub async fn release(&self, lock: &JobLock) {
        match self.service.release(lock).await {
            Ok(true) => debug!(target = %lock.job_id, "Released lock"),
            Ok(false) => warn!(target = %lock.job_id, "Lock was no longer held at release"),
            Err(e) => warn!(target = %lock.job_id, error = %e, "Failed to release lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let service = InMemoryLockService::new();

        let first = service.acquire("t1", "a", TTL).await.unwrap();
        let second = service.acquire("t1", "b", TTL).await.unwrap();
        let other_job = service.acquire("t2", "b", TTL).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(other_job.is_some());
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let service = InMemoryLockService::new();
        let lock = service.acquire("t1", "a", TTL).await.unwrap().unwrap();

        assert!(service.release(&lock).await.unwrap());
        assert!(!service.release(&lock).await.unwrap());
        assert!(service.acquire("t1", "b", TTL).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_is_taken_over_and_old_holder_fenced() {
        let service = InMemoryLockService::new();
        let old = service.acquire("t1", "a", TTL).await.unwrap().unwrap();

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(old.is_expired());

        let new = service.acquire("t1", "b", TTL).await.unwrap().unwrap();
        assert!(new.sequence_number > old.sequence_number);

        assert!(service.renew(&old).await.unwrap().is_none());
        assert!(!service.release(&old).await.unwrap());
        assert_eq!(service.holder("t1").await.unwrap().holder_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lease() {
        let service = InMemoryLockService::new();
        let lock = service.acquire("t1", "a", TTL).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        let renewed = service.renew(&lock).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(!renewed.is_expired());
        assert!(service.acquire("t1", "b", TTL).await.unwrap().is_none());
    }
}
