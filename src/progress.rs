//! Progress events
//!
//! The orchestrator pushes phase, progress, error and completion events to a
//! [`ProgressEmitter`]. Emission never blocks and never fails the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{JobPhase, JobProgress, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    Progress,
    Status,
    Error,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressData {
    /// Overall percentage, 0 to 100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub phase: JobPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_entity: Option<String>,
    pub records_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
}

impl ProgressData {
    pub fn from_progress(progress: &JobProgress) -> Self {
        Self {
            progress: progress.percentage,
            status: None,
            message: None,
            phase: progress.phase,
            current_entity: progress.current_entity.clone(),
            records_processed: progress.records_processed,
            total_records: progress.total_records,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub data: ProgressData,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        job_id: Uuid,
        tenant_id: Uuid,
        event_type: ProgressEventType,
        data: ProgressData,
    ) -> Self {
        Self {
            job_id,
            tenant_id,
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget sink for progress events.
pub trait ProgressEmitter: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Fans events out to every subscriber; slow subscribers drop old events.
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ProgressEmitter for BroadcastEmitter {
    fn emit(&self, event: ProgressEvent) {
        debug!(
            job_id = %event.job_id,
            event_type = ?event.event_type,
            progress = event.data.progress,
            "Progress event"
        );
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}
