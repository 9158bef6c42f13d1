//! Process wiring
//!
//! Builds the shared collaborators (ephemeral store, rate limiter,
//! cancellation oracle, progress emitter, queue, orchestrator) once and hands
//! out the API state, worker and reaper that run on top of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sea_orm::DatabaseConnection;

use crate::cancellation::{CancellationOracle, JobStatusSource};
use crate::config::AppConfig;
use crate::connectors::Registry;
use crate::crypto::CryptoKey;
use crate::jobs::JobService;
use crate::kv::{KvStore, MemoryKvStore};
use crate::orchestrator::Orchestrator;
use crate::progress::{BroadcastEmitter, ProgressEmitter};
use crate::queue::{DbJobQueue, JobQueue};
use crate::rate_limit::RateLimiter;
use crate::reaper::Reaper;
use crate::repositories::{ExtractedBatchRepository, JobRepository};
use crate::server::AppState;
use crate::worker::Worker;

pub struct Services {
    pub state: AppState,
    pub worker: Worker,
    pub reaper: Reaper,
}

impl Services {
    /// Wire every component with the built-in connector registry.
    pub fn new(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<Self> {
        Self::with_registry(config, db, Registry::with_builtin())
    }

    pub fn with_registry(
        config: AppConfig,
        db: DatabaseConnection,
        registry: Registry,
    ) -> anyhow::Result<Self> {
        let crypto_key = config
            .crypto_key
            .clone()
            .context("BRIDGE_CRYPTO_KEY is not configured")
            .and_then(|bytes| CryptoKey::new(bytes).context("BRIDGE_CRYPTO_KEY is invalid"))?;

        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new(config.ephemeral_store_capacity));
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limit.clone()));
        let job_status: Arc<dyn JobStatusSource> = Arc::new(JobRepository::new(db.clone()));
        let oracle = Arc::new(CancellationOracle::new(store, job_status, &config.cancellation));
        let events = Arc::new(BroadcastEmitter::default());
        let emitter: Arc<dyn ProgressEmitter> = events.clone();
        let queue = Arc::new(DbJobQueue::new(db.clone(), config.worker.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            crypto_key.clone(),
            registry.clone(),
            limiter.clone(),
            oracle.clone(),
            emitter.clone(),
            &config,
        ));
        let jobs = Arc::new(JobService::new(
            db.clone(),
            queue.clone(),
            registry.clone(),
            oracle,
            emitter,
        ));

        let job_queue: Arc<dyn JobQueue> = queue;
        let worker = Worker::new(job_queue, orchestrator, config.worker.clone());
        let reaper = Reaper::new(
            ExtractedBatchRepository::new(db.clone(), config.retention.days),
            Duration::from_secs(config.retention.reaper_interval_seconds.max(1)),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("itsm-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let state = AppState {
            config,
            db,
            crypto_key,
            registry,
            limiter,
            jobs,
            events,
            http,
        };

        Ok(Self {
            state,
            worker,
            reaper,
        })
    }
}
