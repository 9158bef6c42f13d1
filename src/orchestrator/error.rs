//! Job failure taxonomy
//!
//! Every way a job can end badly, each with a stable machine-readable code so
//! callers can tell "rate limited" apart from "broken integration".

use sea_orm::DbErr;
use thiserror::Error;

use crate::connectors::ConnectorError;
use crate::models::JobStatus;
use crate::models::job::ParseEnumError;
use crate::repositories::JobFailure;

/// Pipeline stage an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Load,
}

#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Bad job configuration
    #[error("{0}")]
    Validation(String),
    #[error("authentication failed for {connector_type}: {details}")]
    Authentication {
        connector_type: String,
        details: String,
    },
    #[error("rate limited by {connector_type}")]
    RateLimited { connector_type: String },
    #[error(
        "circuit breaker open for {connector_type} ({entity_type}) after {attempts} consecutive 429 responses"
    )]
    CircuitBreakerOpen {
        connector_type: String,
        entity_type: String,
        attempts: u32,
    },
    #[error("extraction of '{entity_type}' failed: {source}")]
    Extraction {
        entity_type: String,
        #[source]
        source: ConnectorError,
    },
    #[error("loading '{entity_type}' failed: {source}")]
    Load {
        entity_type: String,
        #[source]
        source: ConnectorError,
    },
    #[error("cancelled by user")]
    Cancelled,
    /// Infrastructure failure; the job is retried by the queue
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "VALIDATION_ERROR",
            JobError::Authentication { .. } => "AUTHENTICATION_ERROR",
            JobError::RateLimited { .. } => "RATE_LIMITED",
            JobError::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            JobError::Extraction { .. } => "EXTRACTION_ERROR",
            JobError::Load { .. } => "LOAD_ERROR",
            JobError::Cancelled => "CANCELLED",
            JobError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Only infrastructure failures are worth another delivery.
    pub fn is_retriable(&self) -> bool {
        matches!(self, JobError::Internal(_))
    }

    /// Status the job ends in when this error is final.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            JobError::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }

    pub fn failure(&self) -> JobFailure {
        JobFailure {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }

    /// Classify a connector error raised while working on `entity_type`.
    pub fn from_connector(
        stage: Stage,
        connector_type: &str,
        entity_type: &str,
        error: ConnectorError,
    ) -> Self {
        match error {
            ConnectorError::Cancelled => JobError::Cancelled,
            ConnectorError::Authentication { details } => JobError::Authentication {
                connector_type: connector_type.to_string(),
                details,
            },
            ConnectorError::RateLimited { .. } => JobError::RateLimited {
                connector_type: connector_type.to_string(),
            },
            ConnectorError::CircuitBreakerOpen { attempts } => JobError::CircuitBreakerOpen {
                connector_type: connector_type.to_string(),
                entity_type: entity_type.to_string(),
                attempts,
            },
            ConnectorError::Configuration { details } => {
                JobError::Validation(format!("{connector_type}: {details}"))
            }
            ConnectorError::UnsupportedEntity { entity_type } => JobError::Validation(format!(
                "{connector_type} does not support entity type '{entity_type}'"
            )),
            source => match stage {
                Stage::Extract => JobError::Extraction {
                    entity_type: entity_type.to_string(),
                    source,
                },
                Stage::Load => JobError::Load {
                    entity_type: entity_type.to_string(),
                    source,
                },
            },
        }
    }
}

impl From<DbErr> for JobError {
    fn from(error: DbErr) -> Self {
        JobError::Internal(error.to_string())
    }
}

impl From<ParseEnumError> for JobError {
    fn from(error: ParseEnumError) -> Self {
        JobError::Validation(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_errors_map_to_distinct_codes() {
        let cases = [
            (ConnectorError::Cancelled, "CANCELLED"),
            (
                ConnectorError::Authentication {
                    details: "bad key".into(),
                },
                "AUTHENTICATION_ERROR",
            ),
            (
                ConnectorError::CircuitBreakerOpen { attempts: 3 },
                "CIRCUIT_BREAKER_OPEN",
            ),
            (
                ConnectorError::Http {
                    status: 500,
                    body: String::new(),
                },
                "EXTRACTION_ERROR",
            ),
            (
                ConnectorError::UnsupportedEntity {
                    entity_type: "widgets".into(),
                },
                "VALIDATION_ERROR",
            ),
        ];

        for (error, code) in cases {
            let job_error =
                JobError::from_connector(Stage::Extract, "freshservice", "tickets", error);
            assert_eq!(job_error.code(), code);
        }
    }

    #[test]
    fn load_stage_errors_are_load_errors() {
        let error = JobError::from_connector(
            Stage::Load,
            "servicenow",
            "incidents",
            ConnectorError::Network {
                details: "reset".into(),
            },
        );
        assert_eq!(error.code(), "LOAD_ERROR");
        assert!(error.to_string().contains("incidents"));
    }

    #[test]
    fn only_internal_errors_retry() {
        assert!(JobError::Internal("db down".into()).is_retriable());
        assert!(!JobError::Cancelled.is_retriable());
        assert_eq!(JobError::Cancelled.terminal_status(), JobStatus::Cancelled);
        assert_eq!(
            JobError::Validation("x".into()).terminal_status(),
            JobStatus::Failed
        );
    }
}
