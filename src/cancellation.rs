//! Cooperative job cancellation
//!
//! Nothing interrupts an in-flight request. Long-running work instead asks
//! [`CancellationOracle::should_cancel`] at safe points: before each entity,
//! before each detail batch, after every page and after every rate-limit or
//! circuit-breaker sleep. The oracle answers from three sources, cheapest
//! first:
//!
//! 1. the ephemeral `cancel:{job_id}` flag,
//! 2. the cancellation marker carried by the in-flight queue message,
//! 3. the persisted job status, read at most once per fallback interval.
//!
//! The job record stays the source of truth; the flag only speeds up reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::DbErr;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CancellationConfig;
use crate::kv::KvStore;
use crate::models::JobStatus;
use crate::repositories::JobRepository;

/// Authoritative status lookup used by the fallback check.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, DbErr>;
}

#[async_trait]
impl JobStatusSource for JobRepository {
    async fn job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, DbErr> {
        self.status_of(job_id).await
    }
}

fn flag_key(job_id: Uuid) -> String {
    format!("cancel:{job_id}")
}

pub struct CancellationOracle {
    store: Arc<dyn KvStore>,
    jobs: Arc<dyn JobStatusSource>,
    fallback_interval: Duration,
    flag_ttl: Duration,
    last_fallback: Mutex<HashMap<Uuid, Instant>>,
}

impl CancellationOracle {
    pub fn new(
        store: Arc<dyn KvStore>,
        jobs: Arc<dyn JobStatusSource>,
        config: &CancellationConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            fallback_interval: Duration::from_millis(config.fallback_interval_ms),
            flag_ttl: Duration::from_secs(config.flag_ttl_seconds),
            last_fallback: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `job_id` should stop. `marker` is the in-flight message's marker.
    pub async fn should_cancel(&self, job_id: Uuid, marker: Option<&CancellationToken>) -> bool {
        match self.store.get(&flag_key(job_id)).await {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(err) => {
                debug!(job_id = %job_id, error = %err, "Cancellation flag unreadable");
            }
        }

        if marker.is_some_and(|m| m.is_cancelled()) {
            info!(job_id = %job_id, "Cancellation marker set on queue message");
            self.set_flag(job_id).await;
            return true;
        }

        if !self.fallback_due(job_id) {
            return false;
        }

        match self.jobs.job_status(job_id).await {
            Ok(Some(status)) if status.is_failed_or_cancelled() => {
                info!(job_id = %job_id, status = %status, "Job record shows terminal failure");
                if let Some(marker) = marker {
                    marker.cancel();
                }
                self.set_flag(job_id).await;
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Cancellation fallback read failed");
                false
            }
        }
    }

    /// Best-effort write of the ephemeral flag.
    pub async fn set_flag(&self, job_id: Uuid) -> bool {
        match self
            .store
            .set_with_ttl(&flag_key(job_id), "1", self.flag_ttl)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Failed to set cancellation flag");
                false
            }
        }
    }

    /// Drop per-job bookkeeping once the job has finished.
    pub fn release(&self, job_id: Uuid) {
        if let Ok(mut last) = self.last_fallback.lock() {
            last.remove(&job_id);
        }
    }

    /// Claims the fallback slot for `job_id` if the interval has elapsed.
    fn fallback_due(&self, job_id: Uuid) -> bool {
        let Ok(mut last) = self.last_fallback.lock() else {
            return true;
        };
        let now = Instant::now();
        match last.get(&job_id) {
            Some(previous) if now.duration_since(*previous) < self.fallback_interval => false,
            _ => {
                last.insert(job_id, now);
                true
            }
        }
    }
}

/// Cancellation handle passed down the call chain of one job run.
#[derive(Clone)]
pub struct JobCancellation {
    job_id: Uuid,
    oracle: Arc<CancellationOracle>,
    marker: CancellationToken,
}

impl JobCancellation {
    pub fn new(job_id: Uuid, oracle: Arc<CancellationOracle>, marker: CancellationToken) -> Self {
        Self {
            job_id,
            oracle,
            marker,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Marker carried by the in-flight queue message.
    pub fn marker(&self) -> &CancellationToken {
        &self.marker
    }

    pub async fn is_cancelled(&self) -> bool {
        self.oracle.should_cancel(self.job_id, Some(&self.marker)).await
    }

    /// Sleep for `duration`, waking early if the message marker fires.
    pub async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.marker.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKvStore, StoreError, WindowReservation};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeJobs {
        status: Mutex<JobStatus>,
        reads: AtomicU32,
    }

    impl FakeJobs {
        fn new(status: JobStatus) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(status),
                reads: AtomicU32::new(0),
            })
        }

        fn set(&self, status: JobStatus) {
            *self.status.lock().unwrap() = status;
        }
    }

    #[async_trait]
    impl JobStatusSource for FakeJobs {
        async fn job_status(&self, _job_id: Uuid) -> Result<Option<JobStatus>, DbErr> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(*self.status.lock().unwrap()))
        }
    }

    fn oracle(store: Arc<dyn KvStore>, jobs: Arc<FakeJobs>) -> CancellationOracle {
        CancellationOracle::new(store, jobs, &CancellationConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn flag_short_circuits_other_sources() {
        let store = Arc::new(MemoryKvStore::new(16));
        let jobs = FakeJobs::new(JobStatus::Extracting);
        let oracle = oracle(store.clone(), jobs.clone());
        let job_id = Uuid::new_v4();

        oracle.set_flag(job_id).await;
        assert!(oracle.should_cancel(job_id, None).await);
        assert_eq!(jobs.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_sets_flag_for_future_checks() {
        let store = Arc::new(MemoryKvStore::new(16));
        let jobs = FakeJobs::new(JobStatus::Extracting);
        let oracle = oracle(store.clone(), jobs.clone());
        let job_id = Uuid::new_v4();
        let marker = CancellationToken::new();
        marker.cancel();

        assert!(oracle.should_cancel(job_id, Some(&marker)).await);
        assert!(store.get(&flag_key(job_id)).await.unwrap().is_some());
        assert!(oracle.should_cancel(job_id, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_read_is_rate_limited_per_job() {
        let store = Arc::new(MemoryKvStore::new(16));
        let jobs = FakeJobs::new(JobStatus::Extracting);
        let oracle = oracle(store, jobs.clone());
        let job_id = Uuid::new_v4();

        assert!(!oracle.should_cancel(job_id, None).await);
        assert!(!oracle.should_cancel(job_id, None).await);
        assert_eq!(jobs.reads.load(Ordering::SeqCst), 1);

        jobs.set(JobStatus::Cancelled);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!oracle.should_cancel(job_id, None).await);
        assert_eq!(jobs.reads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(oracle.should_cancel(job_id, None).await);
        assert_eq!(jobs.reads.load(Ordering::SeqCst), 2);

        // Flag is now set, so no further reads are needed
        assert!(oracle.should_cancel(job_id, None).await);
        assert_eq!(jobs.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_also_counts_as_cancellation() {
        let store = Arc::new(MemoryKvStore::new(16));
        let oracle = oracle(store, FakeJobs::new(JobStatus::Failed));
        assert!(oracle.should_cancel(Uuid::new_v4(), None).await);
    }

    struct DownStore;

    #[async_trait]
    impl KvStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn window_reserve(
            &self,
            _: &str,
            _: i64,
            _: i64,
            _: u32,
            _: u32,
            _: Duration,
        ) -> Result<WindowReservation, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_falls_back_to_job_record() {
        let jobs = FakeJobs::new(JobStatus::Cancelled);
        let oracle = oracle(Arc::new(DownStore), jobs.clone());
        assert!(oracle.should_cancel(Uuid::new_v4(), None).await);
        assert_eq!(jobs.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_sleep_wakes_on_marker() {
        let store = Arc::new(MemoryKvStore::new(16));
        let oracle = Arc::new(oracle(store, FakeJobs::new(JobStatus::Extracting)));
        let marker = CancellationToken::new();
        let handle = JobCancellation::new(Uuid::new_v4(), oracle, marker.clone());

        let started = Instant::now();
        let sleeper = tokio::spawn({
            let handle = handle.clone();
            async move { handle.sleep(Duration::from_secs(600)).await }
        });
        tokio::time::advance(Duration::from_secs(1)).await;
        marker.cancel();
        sleeper.await.unwrap();

        assert!(Instant::now() - started < Duration::from_secs(600));
        assert!(handle.is_cancelled().await);
    }
}
