//! # Jobs API Handlers
//!
//! Submit, inspect and cancel extraction, loading and migration jobs, and
//! follow their progress over server-sent events.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        Json,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::sync::broadcast::error::RecvError;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension};
use crate::error::{ApiError, conflict, not_found, validation_error};
use crate::jobs::{CancelOutcome, JobSubmission, SubmitError};
use crate::models::{JobConfig, JobKind, JobProgress, JobStatus, job, load_result};
use crate::progress::{ProgressData, ProgressEvent, ProgressEventType};
use crate::repositories::{ExtractedBatchRepository, JobRepository, LoadResultRepository};
use crate::server::AppState;

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 100;

/// Job submission payload
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub job_type: JobKind,
    pub source_connector_id: Uuid,
    /// Required for LOADING and MIGRATION jobs
    #[serde(default)]
    pub destination_connector_id: Option<Uuid>,
    /// Entity types in processing order
    #[schema(example = json!(["tickets", "changes"]))]
    pub entities: Vec<String>,
    #[serde(default)]
    pub config: JobConfig,
}

/// A job as stored
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    #[schema(example = "MIGRATION")]
    pub job_type: String,
    #[schema(example = "QUEUED")]
    pub status: String,
    pub source_connector_id: Uuid,
    pub destination_connector_id: Option<Uuid>,
    pub entities: Vec<String>,
    pub config: JobConfig,
    pub progress: JobProgress,
    /// Machine-readable failure code, set for FAILED and CANCELLED jobs
    #[schema(example = "CIRCUIT_BREAKER_OPEN")]
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl From<job::Model> for JobResponse {
    fn from(model: job::Model) -> Self {
        let entities = model.entity_types();
        let config = model.job_config();
        let progress = model.job_progress();

        Self {
            id: model.id,
            tenant_id: model.tenant_id,
            job_type: model.job_type,
            status: model.status,
            source_connector_id: model.source_connector_id,
            destination_connector_id: model.destination_connector_id,
            entities,
            config,
            progress,
            error_code: model.error_code,
            error_message: model.error_message,
            created_at: model.created_at.to_rfc3339(),
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListJobsQuery {
    /// Filter by status (QUEUED, EXTRACTING, DATA_READY, LOADING, COMPLETED, FAILED, CANCELLED)
    pub status: Option<String>,
    /// Maximum number of jobs to return (default 50, max 100)
    pub limit: Option<u64>,
    /// Number of jobs to skip
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<JobResponse>,
}

/// Outcome of loading one batch
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadResultResponse {
    pub destination_system: String,
    pub success_count: i32,
    pub failure_count: i32,
    /// Per-record errors with field detail
    pub errors: JsonValue,
    pub loaded_at: String,
}

impl From<load_result::Model> for LoadResultResponse {
    fn from(model: load_result::Model) -> Self {
        Self {
            destination_system: model.destination_system,
            success_count: model.success_count,
            failure_count: model.failure_count,
            errors: model.errors,
            loaded_at: model.loaded_at.to_rfc3339(),
        }
    }
}

/// Summary of one extracted batch; records are not included
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub id: Uuid,
    #[schema(example = "tickets")]
    pub entity_type: String,
    pub batch_sequence: i32,
    #[schema(example = "freshservice")]
    pub source_system: String,
    pub record_count: i32,
    /// Whether the transform phase has run
    pub transformed: bool,
    pub extracted_at: String,
    pub expires_at: String,
    pub load_result: Option<LoadResultResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BatchesResponse {
    pub batches: Vec<BatchResponse>,
}

fn submit_error(error: SubmitError) -> ApiError {
    match error {
        SubmitError::Invalid(error) => ApiError::new(
            StatusCode::BAD_REQUEST,
            error.code().to_string(),
            error.to_string(),
        ),
        SubmitError::ConnectorNotFound(id) => not_found(&format!("Connector {id}")),
        SubmitError::Database(error) => error.into(),
        SubmitError::Queue(error) => ApiError::from(anyhow::Error::new(error)),
    }
}

async fn tenant_job(state: &AppState, tenant: Uuid, job_id: Uuid) -> Result<job::Model, ApiError> {
    JobRepository::new(state.db.clone())
        .find_by_tenant(tenant, job_id)
        .await?
        .ok_or_else(|| not_found("Job"))
}

/// Submit a job
#[utoipa::path(
    post,
    path = "/jobs",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader),
    request_body = SubmitJobRequest,
    responses(
        (status = 201, description = "Job accepted and queued", body = JobResponse),
        (status = 400, description = "Invalid job configuration", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Connector not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn submit_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let created = state
        .jobs
        .submit(JobSubmission {
            tenant_id: tenant,
            kind: request.job_type,
            source_connector_id: request.source_connector_id,
            destination_connector_id: request.destination_connector_id,
            entities: request.entities,
            config: request.config,
        })
        .await
        .map_err(submit_error)?;

    Ok((StatusCode::CREATED, Json(created.into())))
}

/// List the tenant's jobs, newest first
#[utoipa::path(
    get,
    path = "/jobs",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader, ListJobsQuery),
    responses(
        (status = 200, description = "Jobs of the tenant", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(validation_error(
            "Invalid limit",
            json!({ "limit": format!("Must be between 1 and {MAX_LIMIT}") }),
        ));
    }

    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|err| validation_error("Invalid status", json!({ "status": err.to_string() })))?;

    let jobs = JobRepository::new(state.db.clone())
        .list_by_tenant(tenant, status, limit, params.offset.unwrap_or(0))
        .await?;

    Ok(Json(JobsResponse {
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
    }))
}

/// Fetch one job
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "The job", body = JobResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = tenant_job(&state, tenant, job_id).await?;
    Ok(Json(job.into()))
}

/// Cancel a job
///
/// Succeeds as soon as the CANCELLED status is persisted. A running worker
/// notices at its next checkpoint.
#[utoipa::path(
    post,
    path = "/jobs/{id}/cancel",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job cancelled", body = JobResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job already finished", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    match state.jobs.cancel(tenant, job_id).await? {
        None => Err(not_found("Job")),
        Some(CancelOutcome::Cancelled(job)) => Ok(Json(job.into())),
        Some(CancelOutcome::AlreadyFinished(job)) => Err(conflict(&format!(
            "Job already finished with status {}",
            job.status
        ))),
    }
}

/// List a job's extracted batches with their load results
#[utoipa::path(
    get,
    path = "/jobs/{id}/batches",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Batches in entity order", body = BatchesResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_batches(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Json<BatchesResponse>, ApiError> {
    let job = tenant_job(&state, tenant, job_id).await?;

    let batches = ExtractedBatchRepository::new(state.db.clone(), state.config.retention.days)
        .list_by_job(job.id)
        .await?;
    let mut results: HashMap<Uuid, load_result::Model> =
        LoadResultRepository::new(state.db.clone())
            .list_by_job(job.id)
            .await?
            .into_iter()
            .map(|result| (result.batch_id, result))
            .collect();

    let batches = batches
        .into_iter()
        .map(|batch| BatchResponse {
            load_result: results.remove(&batch.id).map(LoadResultResponse::from),
            transformed: batch.transformed_records.is_some(),
            id: batch.id,
            entity_type: batch.entity_type,
            batch_sequence: batch.batch_sequence,
            source_system: batch.source_system,
            record_count: batch.record_count,
            extracted_at: batch.extracted_at.to_rfc3339(),
            expires_at: batch.expires_at.to_rfc3339(),
        })
        .collect();

    Ok(Json(BatchesResponse { batches }))
}

/// Whether no further events will follow `event`.
fn ends_stream(event: &ProgressEvent) -> bool {
    match event.event_type {
        ProgressEventType::Complete | ProgressEventType::Error => true,
        ProgressEventType::Status => event.data.status.is_some_and(|status| status.is_final()),
        ProgressEventType::Progress => false,
    }
}

fn sse_event(event: &ProgressEvent) -> Event {
    let name = match event.event_type {
        ProgressEventType::Progress => "progress",
        ProgressEventType::Status => "status",
        ProgressEventType::Error => "error",
        ProgressEventType::Complete => "complete",
    };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(name))
}

/// Stream a job's progress events
///
/// The first event is a status snapshot of the stored job. The stream ends
/// after the job's terminal event.
#[utoipa::path(
    get,
    path = "/jobs/{id}/events",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (
            status = 200,
            description = "Server-sent progress events",
            content_type = "text/event-stream",
            body = ProgressEvent
        ),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn job_events(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before reading the job so no transition falls in between
    let receiver = state.events.subscribe();
    let job = tenant_job(&state, tenant, job_id).await?;

    let mut snapshot_data = ProgressData::from_progress(&job.job_progress());
    let finished = match (job.status(), job.kind()) {
        (Ok(status), Ok(kind)) => {
            snapshot_data = snapshot_data.with_status(status);
            status.is_terminal_for(kind)
        }
        _ => false,
    };
    let snapshot = ProgressEvent::new(
        job.id,
        job.tenant_id,
        ProgressEventType::Status,
        snapshot_data,
    );

    let live = stream::unfold(Some(receiver), move |receiver| async move {
        let mut receiver = receiver?;
        loop {
            match receiver.recv().await {
                Ok(event) if event.job_id == job_id => {
                    let next = if ends_stream(&event) { None } else { Some(receiver) };
                    return Some((Ok(sse_event(&event)), next));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %job_id, skipped, "Event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let first = stream::once(async move { Ok(sse_event(&snapshot)) });
    let events = if finished {
        first.boxed()
    } else {
        first.chain(live).boxed()
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
