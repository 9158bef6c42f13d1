//! Job Worker
//!
//! Poll loop that claims queued job messages and runs them through the
//! [`Orchestrator`]. Slots are bounded by a semaphore (one by default, so two
//! jobs never race for the same rate-limit window). While a job runs, a
//! heartbeat keeps its delivery alive and relays cancel requests made
//! through other processes.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::config::WorkerConfig;
use crate::orchestrator::{JobError, Orchestrator};
use crate::queue::{JobQueue, QueueError, QueueMessage};

/// How long running jobs get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            config,
        }
    }

    /// Run the worker loop until the provided shutdown token fires.
    #[instrument(skip_all, fields(concurrency = self.config.concurrency))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting job worker");
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job worker shutdown requested");
                    break;
                }
                _ = sleep(self.config.poll_interval()) => {
                    if let Err(err) = self.tick(&slots, &mut running).await {
                        error!(error = %err, "Worker tick failed");
                    }
                    while let Some(finished) = running.try_join_next() {
                        if let Err(err) = finished {
                            error!(error = %err, "Job task aborted");
                        }
                    }
                }
            }
        }

        if !running.is_empty() {
            info!(jobs = running.len(), "Waiting for running jobs");
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while running.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                // Their deliveries stall and are redelivered elsewhere
                warn!(jobs = running.len(), "Abandoning jobs still running after grace period");
                running.abort_all();
            }
        }

        info!("Job worker stopped");
    }

    /// Claim and run every ready message inline, one at a time. Returns the
    /// number of messages processed.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        self.recover_stalled().await?;

        let mut processed = 0;
        loop {
            let messages = self.queue.claim(1).await?;
            if messages.is_empty() {
                return Ok(processed);
            }
            for message in messages {
                self.process(message).await;
                processed += 1;
            }
        }
    }

    async fn tick(
        &self,
        slots: &Arc<Semaphore>,
        running: &mut JoinSet<()>,
    ) -> Result<(), QueueError> {
        self.recover_stalled().await?;

        let free = slots.available_permits();
        if free == 0 {
            return Ok(());
        }

        let messages = self.queue.claim(free).await?;
        if !messages.is_empty() {
            debug!(claimed = messages.len(), "Claimed job messages");
        }

        for message in messages {
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            let span = info_span!("job", job_id = %message.job_id);
            running.spawn(
                async move {
                    let _permit = permit;
                    worker.process(message).await;
                }
                .instrument(span),
            );
        }

        Ok(())
    }

    /// Fail jobs whose deliveries stalled on every attempt.
    async fn recover_stalled(&self) -> Result<(), QueueError> {
        let stalled = self
            .queue
            .recover_stalled(self.config.stall_timeout())
            .await?;

        for job in stalled.into_iter().filter(|job| job.dead) {
            warn!(job_id = %job.job_id, "Job stalled on its last delivery; failing it");
            let error = JobError::Internal("job stalled".to_string());
            if let Err(err) = self
                .orchestrator
                .record_failure(job.job_id, job.tenant_id, &error)
                .await
            {
                error!(job_id = %job.job_id, error = %err, "Failed to record stalled job");
            }
        }

        Ok(())
    }

    async fn process(&self, message: QueueMessage) {
        let heartbeat = self.spawn_heartbeat(message.clone());
        let outcome = self.orchestrator.run(&message).await;
        heartbeat.abort();

        let acknowledged = match &outcome {
            Ok(_) => self.queue.complete(&message).await,
            Err(error) if error.is_retriable() && !message.is_last_attempt() => {
                counter!("job_redeliveries_total").increment(1);
                self.queue.fail(&message, &error.to_string(), true).await
            }
            Err(error) if error.is_retriable() => {
                // Out of deliveries; the job will not run again
                if let Err(err) = self
                    .orchestrator
                    .record_failure(message.job_id, message.tenant_id, error)
                    .await
                {
                    error!(job_id = %message.job_id, error = %err, "Failed to record job failure");
                }
                self.queue.fail(&message, &error.to_string(), false).await
            }
            Err(error) => self.queue.fail(&message, &error.to_string(), false).await,
        };

        if let Err(err) = acknowledged {
            error!(job_id = %message.job_id, error = %err, "Failed to settle job message");
        }
    }

    fn spawn_heartbeat(&self, message: QueueMessage) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = (self.config.stall_timeout() / 3).max(Duration::from_secs(1));

        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if let Err(err) = queue.heartbeat(&message).await {
                    warn!(job_id = %message.job_id, error = %err, "Heartbeat failed");
                }
            }
        })
    }
}
