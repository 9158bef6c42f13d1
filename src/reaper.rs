//! Retention reaper
//!
//! Periodically deletes extracted batches (and their load results) once their
//! retention deadline has passed.

use std::time::Duration;

use metrics::counter;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::repositories::ExtractedBatchRepository;

pub struct Reaper {
    batches: ExtractedBatchRepository,
    interval: Duration,
}

impl Reaper {
    pub fn new(batches: ExtractedBatchRepository, interval: Duration) -> Self {
        Self { batches, interval }
    }

    /// Run the reaper loop until the provided shutdown token fires.
    #[instrument(skip_all, fields(interval_secs = self.interval.as_secs()))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting retention reaper");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Retention reaper shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("Retention reaper stopped");
    }

    /// Delete everything past retention once. Returns the number of batches removed.
    pub async fn sweep(&self) -> u64 {
        match self.batches.delete_expired().await {
            Ok(0) => {
                debug!("No expired batches");
                0
            }
            Ok(removed) => {
                info!(removed, "Deleted expired extracted batches");
                counter!("batches_reaped_total").increment(removed);
                removed
            }
            Err(err) => {
                error!(error = %err, "Retention sweep failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::repositories::NewBatch;
    use serde_json::json;
    use uuid::Uuid;

    fn batch(job_id: Uuid, entity_type: &str) -> NewBatch {
        NewBatch {
            job_id,
            tenant_id: Uuid::new_v4(),
            entity_type: entity_type.to_string(),
            batch_sequence: 0,
            source_system: "freshservice".to_string(),
            records: vec![json!({"id": 1}), json!({"id": 2})],
        }
    }

    #[tokio::test]
    async fn sweep_removes_expired_batches_only() {
        let db = test_db().await;
        let job_id = Uuid::new_v4();

        // Zero-day retention expires immediately
        let expired = ExtractedBatchRepository::new(db.clone(), 0);
        let fresh = ExtractedBatchRepository::new(db.clone(), 7);
        let old = expired.replace(batch(job_id, "tickets")).await.unwrap();
        let kept = fresh.replace(batch(job_id, "changes")).await.unwrap();

        let reaper = Reaper::new(fresh.clone(), Duration::from_secs(60));
        assert_eq!(reaper.sweep().await, 1);

        assert!(fresh.find_by_id(old.id).await.unwrap().is_none());
        assert!(fresh.find_by_id(kept.id).await.unwrap().is_some());
        assert_eq!(reaper.sweep().await, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let db = test_db().await;
        let reaper = Reaper::new(ExtractedBatchRepository::new(db, 7), Duration::from_secs(3600));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), reaper.run(shutdown))
            .await
            .expect("reaper should stop once shutdown fires");
    }
}
