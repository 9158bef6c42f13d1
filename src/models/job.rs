//! Job entity model
//!
//! SeaORM entity for the `jobs` table plus the typed views the orchestrator
//! works with: [`JobKind`], [`JobStatus`], [`JobConfig`] and [`JobProgress`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::connector::Entity as Connector;

/// Job entity representing one extraction, loading or migration run
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// EXTRACTION, LOADING or MIGRATION
    pub job_type: String,

    pub source_connector_id: Uuid,

    /// Required for LOADING and MIGRATION jobs
    pub destination_connector_id: Option<Uuid>,

    /// Ordered list of entity type names
    #[sea_orm(column_type = "JsonBinary")]
    pub entities: JsonValue,

    /// Serialized [`JobConfig`]
    #[sea_orm(column_type = "JsonBinary")]
    pub config: JsonValue,

    /// Current [`JobStatus`] in its wire form
    pub status: String,

    /// Serialized [`JobProgress`]
    #[sea_orm(column_type = "JsonBinary")]
    pub progress: JsonValue,

    /// Machine-readable failure code (see `JobError::code`)
    pub error_code: Option<String>,

    pub error_message: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Connector",
        from = "Column::SourceConnectorId",
        to = "super::connector::Column::Id"
    )]
    SourceConnector,
    #[sea_orm(has_many = "super::extracted_batch::Entity")]
    ExtractedBatches,
}

impl Related<Connector> for Entity {
    fn to() -> RelationDef {
        Relation::SourceConnector.def()
    }
}

impl Related<super::extracted_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExtractedBatches.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn kind(&self) -> Result<JobKind, ParseEnumError> {
        self.job_type.parse()
    }

    pub fn status(&self) -> Result<JobStatus, ParseEnumError> {
        self.status.parse()
    }

    /// Entity types in the order the caller supplied them.
    pub fn entity_types(&self) -> Vec<String> {
        serde_json::from_value(self.entities.clone()).unwrap_or_default()
    }

    pub fn job_config(&self) -> JobConfig {
        serde_json::from_value(self.config.clone()).unwrap_or_default()
    }

    pub fn job_progress(&self) -> JobProgress {
        serde_json::from_value(self.progress.clone()).unwrap_or_default()
    }
}

/// Error returned when a stored enum string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// What a job does end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Extract and transform; stops at DATA_READY
    Extraction,
    /// Extract, transform and load straight into the destination
    Loading,
    /// Extract to DATA_READY, then load into the destination
    Migration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extraction => "EXTRACTION",
            JobKind::Loading => "LOADING",
            JobKind::Migration => "MIGRATION",
        }
    }

    pub fn requires_destination(&self) -> bool {
        !matches!(self, JobKind::Extraction)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXTRACTION" => Ok(JobKind::Extraction),
            "LOADING" => Ok(JobKind::Loading),
            "MIGRATION" => Ok(JobKind::Migration),
            other => Err(ParseEnumError {
                kind: "job kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Extracting,
    DataReady,
    Loading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Extracting => "EXTRACTING",
            JobStatus::DataReady => "DATA_READY",
            JobStatus::Loading => "LOADING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal regardless of job kind.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Terminal for a job of the given kind. DATA_READY ends extraction-only jobs.
    pub fn is_terminal_for(&self, kind: JobKind) -> bool {
        self.is_final() || (*self == JobStatus::DataReady && kind == JobKind::Extraction)
    }

    /// Whether a failed or cancelled outcome has already been recorded.
    pub fn is_failed_or_cancelled(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Edges of the job state machine. FAILED and CANCELLED are reachable from
    /// every non-terminal state; forward edges depend on the job kind.
    pub fn can_transition_to(&self, next: JobStatus, kind: JobKind) -> bool {
        if self.is_terminal_for(kind) {
            return false;
        }

        if next.is_failed_or_cancelled() {
            return true;
        }

        matches!(
            (self, next, kind),
            (JobStatus::Queued, JobStatus::Extracting, _)
                | (
                    JobStatus::Extracting,
                    JobStatus::DataReady,
                    JobKind::Extraction | JobKind::Migration
                )
                | (JobStatus::Extracting, JobStatus::Loading, JobKind::Loading)
                | (JobStatus::DataReady, JobStatus::Loading, JobKind::Migration)
                | (JobStatus::Loading, JobStatus::Completed, _)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "EXTRACTING" => Ok(JobStatus::Extracting),
            "DATA_READY" => Ok(JobStatus::DataReady),
            "LOADING" => Ok(JobStatus::Loading),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(ParseEnumError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// Per-job extraction options supplied at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Records requested per list page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Stop after this many records per entity type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u64>,
    /// Run per-record detail fetches for entity types that support them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_details: Option<bool>,
    /// Concurrent detail fetches per batch (capped at 20)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_batch_size: Option<usize>,
}

/// Phase reported in [`JobProgress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    #[default]
    Queued,
    Extracting,
    Transforming,
    Loading,
    Done,
}

/// Structured progress stored on the job record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub phase: JobPhase,
    /// Overall completion, 0 to 100
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_entity: Option<String>,
    pub records_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
    pub entities_completed: usize,
    pub entities_total: usize,
}

impl JobProgress {
    pub fn new(entities_total: usize) -> Self {
        Self {
            entities_total,
            ..Default::default()
        }
    }

    /// Percentage within a phase band given whole entities completed.
    pub fn band_percentage(&self, band_start: u8, band_end: u8) -> u8 {
        if self.entities_total == 0 {
            return band_end;
        }
        let span = (band_end - band_start) as usize;
        let done = self.entities_completed.min(self.entities_total);
        band_start + (span * done / self.entities_total) as u8
    }
}
