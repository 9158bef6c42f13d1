//! Connector trait definition
//!
//! The capability contract every platform adapter implements: connection
//! checks, paginated extraction with an optional per-record detail phase,
//! transformation in both directions, validation and best-effort batch
//! loading.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use utoipa::ToSchema;

use crate::connectors::ConnectorMetadata;
use crate::connectors::pagination;
use crate::rate_limit::CircuitBreakerError;
use crate::rate_limit::circuit_breaker::RateLimitSignal;

/// Connector-specific error types for structured error handling
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// Credentials rejected by the platform
    #[error("authentication failed: {details}")]
    Authentication { details: String },
    /// HTTP 429 from the platform
    #[error("rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },
    /// Too many consecutive 429 responses for one request
    #[error("circuit breaker open after {attempts} consecutive 429 responses")]
    CircuitBreakerOpen { attempts: u32 },
    /// Any other non-success HTTP status
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {details}")]
    Network { details: String },
    #[error("malformed response: {details}")]
    MalformedResponse { details: String },
    #[error("configuration error: {details}")]
    Configuration { details: String },
    #[error("entity type '{entity_type}' is not supported")]
    UnsupportedEntity { entity_type: String },
    /// Cooperative cancellation observed at a checkpoint
    #[error("cancelled by user")]
    Cancelled,
}

impl ConnectorError {
    pub fn malformed(details: impl Into<String>) -> Self {
        Self::MalformedResponse {
            details: details.into(),
        }
    }

    pub fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration {
            details: details.into(),
        }
    }

    /// Errors that must stop a whole batch rather than one record
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::CircuitBreakerOpen { .. }
                | Self::Cancelled
                | Self::Configuration { .. }
        )
    }
}

impl RateLimitSignal for ConnectorError {
    fn rate_limited(&self) -> Option<Option<Duration>> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<CircuitBreakerError<ConnectorError>> for ConnectorError {
    fn from(error: CircuitBreakerError<ConnectorError>) -> Self {
        match error {
            CircuitBreakerError::Open { attempts, .. } => Self::CircuitBreakerOpen { attempts },
            CircuitBreakerError::Inner(inner) => inner,
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::malformed(error.to_string())
        } else {
            Self::Network {
                details: error.to_string(),
            }
        }
    }
}

/// Position in a paginated listing. Repeating a cursor repeats the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    /// 1-based page number
    Page(u32),
    /// 0-based record offset
    Offset(u64),
    /// Opaque platform token
    Token(String),
}

/// Parameters for one list call.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub batch_size: u32,
    /// `None` requests the first page
    pub cursor: Option<Cursor>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_records: Option<u64>,
    pub include_details: bool,
    pub detail_batch_size: usize,
    pub detail_batch_delay: Duration,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            cursor: None,
            start_date: None,
            end_date: None,
            max_records: None,
            include_details: false,
            detail_batch_size: 10,
            detail_batch_delay: Duration::from_millis(1000),
        }
    }
}

impl ExtractOptions {
    pub fn at(&self, cursor: Option<Cursor>) -> Self {
        Self {
            cursor,
            ..self.clone()
        }
    }
}

/// One page returned by [`Connector::extract`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractPage {
    pub records: Vec<JsonValue>,
    /// Platform-reported total; informational only
    pub total_count: Option<u64>,
    /// The only signal that ends pagination
    pub has_more: bool,
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStage {
    List,
    Detail,
}

/// Sub-entity progress reported at every extraction checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionProgress {
    pub entity_type: String,
    pub stage: ExtractionStage,
    pub records_fetched: u64,
    pub total_count: Option<u64>,
}

/// Hooks the caller of a long-running extraction provides.
#[async_trait]
pub trait ExtractionControl: Send + Sync {
    /// Called after every page and before every detail batch. Returning an
    /// error (usually [`ConnectorError::Cancelled`]) stops the extraction.
    async fn checkpoint(&self, progress: &ExtractionProgress) -> Result<(), ConnectorError>;

    /// Pause between detail batches.
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Control that never cancels; used by connection tests and unit tests.
pub struct Unattended;

#[async_trait]
impl ExtractionControl for Unattended {
    async fn checkpoint(&self, _progress: &ExtractionProgress) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Why one record could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    /// Position of the record in the submitted batch
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

impl RecordError {
    pub fn new(index: usize, message: impl Into<String>) -> Self {
        Self {
            index,
            record_id: None,
            message: message.into(),
            field_errors: Vec::new(),
        }
    }

    pub fn with_record_id(mut self, record_id: Option<String>) -> Self {
        self.record_id = record_id;
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.field_errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
        self
    }
}

/// Result of loading one batch: a fold over its records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub success_count: u64,
    pub errors: Vec<RecordError>,
}

impl LoadOutcome {
    pub fn failure_count(&self) -> u64 {
        self.errors.len() as u64
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, error: RecordError) {
        self.errors.push(error);
    }
}

/// Connector trait that all platform adapters implement
#[async_trait]
pub trait Connector: Send + Sync {
    fn metadata(&self) -> &ConnectorMetadata;

    /// Cheap authenticated call proving the configuration works.
    async fn test_connection(&self) -> Result<(), ConnectorError>;

    /// Obtain or validate credentials before extraction or loading.
    async fn authenticate(&self) -> Result<(), ConnectorError>;

    /// Fetch a single page of `entity_type`.
    async fn extract(
        &self,
        entity_type: &str,
        options: &ExtractOptions,
    ) -> Result<ExtractPage, ConnectorError>;

    /// Fetch the full record behind a list entry.
    async fn fetch_detail(
        &self,
        entity_type: &str,
        _record: &JsonValue,
    ) -> Result<JsonValue, ConnectorError> {
        Err(ConnectorError::UnsupportedEntity {
            entity_type: entity_type.to_string(),
        })
    }

    /// Extract every page of `entity_type`, then run the detail phase when
    /// requested and supported.
    async fn extract_with_progress(
        &self,
        entity_type: &str,
        options: &ExtractOptions,
        control: &dyn ExtractionControl,
    ) -> Result<Vec<JsonValue>, ConnectorError> {
        pagination::extract_all(self, entity_type, options, control).await
    }

    /// Map platform records to the canonical extraction shape.
    fn transform_for_extraction(
        &self,
        _entity_type: &str,
        records: &[JsonValue],
    ) -> Vec<JsonValue> {
        records.to_vec()
    }

    /// Map canonical records to this platform's create payloads.
    fn transform_for_load(&self, _entity_type: &str, records: &[JsonValue]) -> Vec<JsonValue> {
        records.to_vec()
    }

    /// Per-record problems that would make the platform reject a payload.
    fn validate_for_load(&self, _entity_type: &str, _records: &[JsonValue]) -> Vec<RecordError> {
        Vec::new()
    }

    /// Best-effort insertion. Rejected records are reported, not raised.
    async fn load_batch(
        &self,
        entity_type: &str,
        records: &[JsonValue],
    ) -> Result<LoadOutcome, ConnectorError>;
}
