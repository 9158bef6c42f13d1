//! Job Orchestrator
//!
//! Drives one delivered job through its state machine:
//!
//! ```text
//! QUEUED -> EXTRACTING -> DATA_READY                      (EXTRACTION)
//! QUEUED -> EXTRACTING -> DATA_READY -> LOADING -> COMPLETED   (MIGRATION)
//! QUEUED -> EXTRACTING -> LOADING -> COMPLETED                 (LOADING)
//! ```
//!
//! FAILED and CANCELLED are reachable from every non-terminal state. Each
//! phase boundary is persisted before the next phase begins, and every
//! transition is conditional on the status last observed so a concurrent
//! cancellation always wins.
//!
//! A redelivered message resumes from the persisted status: terminal jobs are
//! acknowledged, EXTRACTING re-extracts (replacing batches), DATA_READY of a
//! migration starts loading and LOADING loads whatever batches have no load
//! result yet.

pub mod error;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde_json::Value as JsonValue;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::cancellation::{CancellationOracle, JobCancellation};
use crate::config::{AppConfig, ExtractionConfig, MAX_DETAIL_BATCH_SIZE};
use crate::connectors::canonical;
use crate::connectors::{
    Connector, ConnectorContext, ConnectorError, ConnectorMetadata, ExtractOptions,
    ExtractionControl, ExtractionProgress, LoadOutcome, RecordError, Registry,
};
use crate::crypto::CryptoKey;
use crate::models::{JobConfig, JobKind, JobPhase, JobProgress, JobStatus};
use crate::models::{connector, extracted_batch, job};
use crate::progress::{ProgressData, ProgressEmitter, ProgressEvent, ProgressEventType};
use crate::queue::QueueMessage;
use crate::rate_limit::RateLimiter;
use crate::repositories::{
    ConnectorRepository, ExtractedBatchRepository, JobRepository, LoadResultRepository, NewBatch,
};

pub use error::{JobError, Stage};

/// Percentage bands of one job kind's phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bands {
    extract: (u8, u8),
    transform: (u8, u8),
    load: (u8, u8),
}

impl Bands {
    fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Extraction => Bands {
                extract: (0, 80),
                transform: (80, 100),
                load: (100, 100),
            },
            JobKind::Loading | JobKind::Migration => Bands {
                extract: (0, 40),
                transform: (40, 50),
                load: (50, 100),
            },
        }
    }
}

/// Reject a job whose shape cannot run. Used before enqueue and again when a
/// worker picks the job up.
pub fn validate_job(
    kind: JobKind,
    entities: &[String],
    config: &JobConfig,
    source: &ConnectorMetadata,
    destination: Option<&ConnectorMetadata>,
) -> Result<(), JobError> {
    if entities.is_empty() {
        return Err(JobError::Validation(
            "at least one entity type is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for entity in entities {
        if !seen.insert(entity.as_str()) {
            return Err(JobError::Validation(format!(
                "entity type '{entity}' is listed twice"
            )));
        }
        if !source.supports_entity(entity) {
            return Err(JobError::Validation(format!(
                "{} does not support entity type '{entity}'",
                source.connector_type
            )));
        }
    }

    match (kind.requires_destination(), destination) {
        (true, None) => {
            return Err(JobError::Validation(format!(
                "{kind} jobs require a destination connector"
            )));
        }
        (false, Some(_)) => {
            return Err(JobError::Validation(format!(
                "{kind} jobs do not take a destination connector"
            )));
        }
        (true, Some(destination)) => {
            for entity in entities {
                let loadable = destination
                    .entity(entity)
                    .is_some_and(|info| info.supports_load);
                if !loadable {
                    return Err(JobError::Validation(format!(
                        "{} cannot load entity type '{entity}'",
                        destination.connector_type
                    )));
                }
            }
        }
        (false, None) => {}
    }

    if let Some(batch_size) = config.batch_size
        && (batch_size == 0 || batch_size > source.max_page_size)
    {
        return Err(JobError::Validation(format!(
            "batchSize must be between 1 and {}",
            source.max_page_size
        )));
    }

    if let Some(size) = config.detail_batch_size
        && (size == 0 || size > MAX_DETAIL_BATCH_SIZE)
    {
        return Err(JobError::Validation(format!(
            "detailBatchSize must be between 1 and {MAX_DETAIL_BATCH_SIZE}"
        )));
    }

    if config.max_records == Some(0) {
        return Err(JobError::Validation(
            "maxRecords must be positive".to_string(),
        ));
    }

    if let (Some(start), Some(end)) = (config.start_date, config.end_date)
        && start > end
    {
        return Err(JobError::Validation(
            "startDate must not be after endDate".to_string(),
        ));
    }

    Ok(())
}

fn extract_options(
    config: &JobConfig,
    defaults: &ExtractionConfig,
    metadata: &ConnectorMetadata,
) -> ExtractOptions {
    ExtractOptions {
        batch_size: config
            .batch_size
            .unwrap_or(defaults.page_size)
            .min(metadata.max_page_size)
            .max(1),
        cursor: None,
        start_date: config.start_date,
        end_date: config.end_date,
        max_records: config.max_records,
        include_details: config.include_details.unwrap_or(true),
        detail_batch_size: config
            .detail_batch_size
            .unwrap_or(defaults.detail_batch_size),
        detail_batch_delay: Duration::from_millis(defaults.detail_batch_delay_ms),
    }
}

/// Progress reporting and cancellation for one entity's extraction.
struct JobControl<'a> {
    orchestrator: &'a Orchestrator,
    job: &'a job::Model,
    cancellation: &'a JobCancellation,
    /// Progress as of the start of this entity
    base: JobProgress,
}

#[async_trait]
impl ExtractionControl for JobControl<'_> {
    async fn checkpoint(&self, progress: &ExtractionProgress) -> Result<(), ConnectorError> {
        if self.cancellation.is_cancelled().await {
            return Err(ConnectorError::Cancelled);
        }

        let offset = self.base.records_processed;
        let snapshot = JobProgress {
            records_processed: offset + progress.records_fetched,
            total_records: progress.total_count.map(|total| offset + total),
            ..self.base.clone()
        };
        self.orchestrator.publish_progress(self.job, &snapshot).await;
        Ok(())
    }

    async fn sleep(&self, duration: Duration) {
        self.cancellation.sleep(duration).await;
    }
}

pub struct Orchestrator {
    jobs: JobRepository,
    batches: ExtractedBatchRepository,
    load_results: LoadResultRepository,
    connectors: ConnectorRepository,
    registry: Arc<Registry>,
    limiter: Arc<RateLimiter>,
    oracle: Arc<CancellationOracle>,
    emitter: Arc<dyn ProgressEmitter>,
    extraction: ExtractionConfig,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(
        db: DatabaseConnection,
        crypto_key: CryptoKey,
        registry: Arc<Registry>,
        limiter: Arc<RateLimiter>,
        oracle: Arc<CancellationOracle>,
        emitter: Arc<dyn ProgressEmitter>,
        config: &AppConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("itsm-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            jobs: JobRepository::new(db.clone()),
            batches: ExtractedBatchRepository::new(db.clone(), config.retention.days),
            load_results: LoadResultRepository::new(db.clone()),
            connectors: ConnectorRepository::new(db, crypto_key),
            registry,
            limiter,
            oracle,
            emitter,
            extraction: config.extraction.clone(),
            http,
        }
    }

    /// Drive the job behind `message` as far as it can go.
    ///
    /// `Ok` carries the status the job rests in (the message can be
    /// acknowledged). Non-retriable errors have already been recorded on the
    /// job when this returns; [`JobError::Internal`] leaves the job untouched
    /// for the queue to redeliver.
    #[instrument(
        skip_all,
        fields(job_id = %message.job_id, tenant_id = %message.tenant_id, attempt = message.attempt)
    )]
    pub async fn run(&self, message: &QueueMessage) -> Result<JobStatus, JobError> {
        let started = Instant::now();
        let result = self.drive(message).await;

        let result = match result {
            Ok(status) => {
                info!(
                    status = %status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job finished"
                );
                counter!("jobs_finished_total", "status" => status.as_str()).increment(1);
                histogram!("job_duration_seconds").record(started.elapsed().as_secs_f64());
                Ok(status)
            }
            Err(error) if error.is_retriable() => {
                warn!(
                    error = %error,
                    "Job interrupted by an internal error; leaving it for redelivery"
                );
                Err(error)
            }
            Err(error) => {
                warn!(code = error.code(), error = %error, "Job failed");
                match self
                    .record_failure(message.job_id, message.tenant_id, &error)
                    .await
                {
                    Ok(()) => {
                        let status = error.terminal_status();
                        counter!("jobs_finished_total", "status" => status.as_str()).increment(1);
                        histogram!("job_duration_seconds").record(started.elapsed().as_secs_f64());
                        Err(error)
                    }
                    Err(db_error) => Err(JobError::from(db_error)),
                }
            }
        };

        self.oracle.release(message.job_id);
        result
    }

    /// Persist `error` as the job's terminal outcome unless the job already
    /// reached a terminal state (for example, cancelled by the user).
    pub async fn record_failure(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        error: &JobError,
    ) -> Result<(), sea_orm::DbErr> {
        let target = error.terminal_status();

        for _ in 0..5 {
            let Some(job) = self.jobs.find_by_id(job_id).await? else {
                return Ok(());
            };
            let (Ok(kind), Ok(status)) = (job.kind(), job.status()) else {
                return Ok(());
            };
            if !status.can_transition_to(target, kind) {
                debug!(
                    job_id = %job_id,
                    status = %status,
                    "Job already terminal; failure not recorded"
                );
                return Ok(());
            }

            if self
                .jobs
                .transition(job_id, status, target, Some(error.failure()))
                .await?
            {
                self.emit(
                    job_id,
                    tenant_id,
                    ProgressEventType::Error,
                    ProgressData::from_progress(&job.job_progress())
                        .with_status(target)
                        .with_message(error.to_string()),
                );
                return Ok(());
            }
        }

        Err(sea_orm::DbErr::Custom(format!(
            "job {job_id} changed status repeatedly while recording failure"
        )))
    }

    async fn drive(&self, message: &QueueMessage) -> Result<JobStatus, JobError> {
        let job = self
            .jobs
            .find_by_id(message.job_id)
            .await?
            .ok_or_else(|| JobError::Validation(format!("job {} does not exist", message.job_id)))?;
        let kind = job.kind()?;
        let mut status = job.status()?;

        if status.is_terminal_for(kind) {
            info!(status = %status, "Job already finished; acknowledging delivery");
            return Ok(status);
        }

        let cancellation =
            JobCancellation::new(job.id, self.oracle.clone(), message.marker.clone());
        if cancellation.is_cancelled().await {
            return Err(JobError::Cancelled);
        }

        let entities = job.entity_types();
        let config = job.job_config();

        let source_row = self
            .connector_row(job.tenant_id, job.source_connector_id, "source")
            .await?;
        let source = self.build_connector(&source_row, &cancellation)?;
        let destination = match job.destination_connector_id {
            Some(id) => {
                let row = self.connector_row(job.tenant_id, id, "destination").await?;
                let connector = self.build_connector(&row, &cancellation)?;
                Some((row, connector))
            }
            None => None,
        };

        validate_job(
            kind,
            &entities,
            &config,
            source.metadata(),
            destination.as_ref().map(|(_, connector)| connector.metadata()),
        )?;

        let bands = Bands::for_kind(kind);
        let first_entity = entities.first().map(String::as_str).unwrap_or_default();

        if status == JobStatus::Queued {
            self.advance(&job, JobStatus::Queued, JobStatus::Extracting)
                .await?;
            status = JobStatus::Extracting;
        }

        if status == JobStatus::Extracting {
            source.authenticate().await.map_err(|error| {
                JobError::from_connector(
                    Stage::Extract,
                    &source_row.connector_type,
                    first_entity,
                    error,
                )
            })?;

            self.extract(
                &job,
                &source_row,
                source.as_ref(),
                &entities,
                &config,
                &cancellation,
                bands,
            )
            .await?;
            self.transform(&job, source.as_ref(), &cancellation, bands)
                .await?;

            let next = if kind == JobKind::Loading {
                JobStatus::Loading
            } else {
                JobStatus::DataReady
            };
            self.advance(&job, JobStatus::Extracting, next).await?;

            if kind == JobKind::Extraction {
                self.finish(&job, JobStatus::DataReady, bands.transform.1);
                return Ok(JobStatus::DataReady);
            }
            status = next;
        }

        if status == JobStatus::DataReady {
            self.advance(&job, JobStatus::DataReady, JobStatus::Loading)
                .await?;
        }

        let (destination_row, destination) = destination.ok_or_else(|| {
            JobError::Validation(format!("{kind} jobs require a destination connector"))
        })?;

        destination.authenticate().await.map_err(|error| {
            JobError::from_connector(
                Stage::Load,
                &destination_row.connector_type,
                first_entity,
                error,
            )
        })?;

        self.load(&job, &destination_row, destination.as_ref(), &cancellation, bands)
            .await?;
        self.advance(&job, JobStatus::Loading, JobStatus::Completed)
            .await?;
        self.finish(&job, JobStatus::Completed, bands.load.1);

        Ok(JobStatus::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn extract(
        &self,
        job: &job::Model,
        source_row: &connector::Model,
        source: &dyn Connector,
        entities: &[String],
        config: &JobConfig,
        cancellation: &JobCancellation,
        bands: Bands,
    ) -> Result<(), JobError> {
        let (band_start, band_end) = bands.extract;
        let options = extract_options(config, &self.extraction, source.metadata());
        let mut progress = JobProgress {
            phase: JobPhase::Extracting,
            percentage: band_start,
            ..JobProgress::new(entities.len())
        };

        for (sequence, entity_type) in entities.iter().enumerate() {
            if cancellation.is_cancelled().await {
                return Err(JobError::Cancelled);
            }

            progress.current_entity = Some(entity_type.clone());
            progress.total_records = None;
            self.publish_progress(job, &progress).await;

            let control = JobControl {
                orchestrator: self,
                job,
                cancellation,
                base: progress.clone(),
            };

            let records = source
                .extract_with_progress(entity_type, &options, &control)
                .instrument(info_span!("extract_entity", entity_type = %entity_type))
                .await
                .map_err(|error| {
                    JobError::from_connector(
                        Stage::Extract,
                        &source_row.connector_type,
                        entity_type,
                        error,
                    )
                })?;

            let count = records.len() as u64;
            let sequence = i32::try_from(sequence)
                .map_err(|_| JobError::Validation("too many entity types".to_string()))?;

            self.batches
                .replace(NewBatch {
                    job_id: job.id,
                    tenant_id: job.tenant_id,
                    entity_type: entity_type.clone(),
                    batch_sequence: sequence,
                    source_system: source_row.connector_type.clone(),
                    records,
                })
                .await?;

            counter!(
                "records_extracted_total",
                "connector_type" => source_row.connector_type.clone()
            )
            .increment(count);
            info!(entity_type = %entity_type, records = count, "Entity extracted");

            progress.entities_completed += 1;
            progress.records_processed += count;
            progress.percentage = progress.band_percentage(band_start, band_end);
            self.publish_progress(job, &progress).await;
        }

        Ok(())
    }

    async fn transform(
        &self,
        job: &job::Model,
        source: &dyn Connector,
        cancellation: &JobCancellation,
        bands: Bands,
    ) -> Result<(), JobError> {
        let (band_start, band_end) = bands.transform;
        let batches = self.batches.list_by_job(job.id).await?;
        let mut progress = JobProgress {
            phase: JobPhase::Transforming,
            percentage: band_start,
            ..JobProgress::new(batches.len())
        };

        for batch in batches {
            if cancellation.is_cancelled().await {
                return Err(JobError::Cancelled);
            }

            let transformed = source.transform_for_extraction(&batch.entity_type, &batch.raw());
            self.batches.set_transformed(batch.id, transformed).await?;

            progress.current_entity = Some(batch.entity_type.clone());
            progress.entities_completed += 1;
            progress.records_processed += batch.record_count.max(0) as u64;
            progress.percentage = progress.band_percentage(band_start, band_end);
            self.publish_progress(job, &progress).await;
        }

        Ok(())
    }

    async fn load(
        &self,
        job: &job::Model,
        destination_row: &connector::Model,
        destination: &dyn Connector,
        cancellation: &JobCancellation,
        bands: Bands,
    ) -> Result<(), JobError> {
        let (band_start, band_end) = bands.load;
        let batches = self.batches.list_by_job(job.id).await?;
        let loaded: HashSet<Uuid> = self
            .load_results
            .list_by_job(job.id)
            .await?
            .into_iter()
            .map(|result| result.batch_id)
            .collect();

        let mut progress = JobProgress {
            phase: JobPhase::Loading,
            ..JobProgress::new(batches.len())
        };
        progress.entities_completed = batches.iter().filter(|b| loaded.contains(&b.id)).count();
        progress.percentage = progress.band_percentage(band_start, band_end);

        for batch in batches.iter().filter(|batch| !loaded.contains(&batch.id)) {
            if cancellation.is_cancelled().await {
                return Err(JobError::Cancelled);
            }

            progress.current_entity = Some(batch.entity_type.clone());
            self.publish_progress(job, &progress).await;

            let outcome = self
                .load_records(destination, &destination_row.connector_type, batch, cancellation)
                .instrument(info_span!("load_entity", entity_type = %batch.entity_type))
                .await?;

            self.load_results
                .record(batch, &destination_row.connector_type, &outcome)
                .await?;

            counter!(
                "records_loaded_total",
                "connector_type" => destination_row.connector_type.clone()
            )
            .increment(outcome.success_count);
            info!(
                entity_type = %batch.entity_type,
                loaded = outcome.success_count,
                failed = outcome.failure_count(),
                "Entity loaded"
            );

            progress.entities_completed += 1;
            progress.records_processed += batch.record_count.max(0) as u64;
            progress.percentage = progress.band_percentage(band_start, band_end);
            self.publish_progress(job, &progress).await;
        }

        Ok(())
    }

    /// Transform, validate and load one batch. Records failing validation are
    /// reported without being sent; the rest go out in chunks no larger than
    /// the destination accepts.
    async fn load_records(
        &self,
        destination: &dyn Connector,
        connector_type: &str,
        batch: &extracted_batch::Model,
        cancellation: &JobCancellation,
    ) -> Result<LoadOutcome, JobError> {
        let entity_type = batch.entity_type.as_str();
        let records = batch.records_for_load();
        let mut payloads = destination.transform_for_load(entity_type, &records);
        payloads.truncate(records.len());

        let mut errors: BTreeMap<usize, RecordError> = BTreeMap::new();
        for error in destination.validate_for_load(entity_type, &payloads) {
            if error.index < payloads.len() {
                errors.entry(error.index).or_insert(error);
            } else {
                warn!(index = error.index, "Ignoring validation error outside the batch");
            }
        }
        for index in payloads.len()..records.len() {
            let error = RecordError::new(index, "record was dropped by the load transform");
            errors.insert(index, error);
        }
        let valid: Vec<usize> = (0..payloads.len())
            .filter(|index| !errors.contains_key(index))
            .collect();

        let chunk_size = destination.metadata().max_load_batch_size.max(1);
        let mut success_count = 0;

        for chunk in valid.chunks(chunk_size) {
            if cancellation.is_cancelled().await {
                return Err(JobError::Cancelled);
            }

            let chunk_payloads: Vec<JsonValue> =
                chunk.iter().map(|&index| payloads[index].clone()).collect();
            let result = destination
                .load_batch(entity_type, &chunk_payloads)
                .await
                .map_err(|error| {
                    JobError::from_connector(Stage::Load, connector_type, entity_type, error)
                })?;

            success_count += merge_chunk_outcome(chunk, result, &mut errors);
        }

        let errors: Vec<RecordError> = errors
            .into_values()
            .map(|mut error| {
                if error.record_id.is_none() {
                    error.record_id = records.get(error.index).and_then(canonical::record_id);
                }
                error
            })
            .collect();

        if success_count + errors.len() as u64 != records.len() as u64 {
            return Err(JobError::Internal(format!(
                "load of {entity_type} accounted for {} of {} records",
                success_count + errors.len() as u64,
                records.len()
            )));
        }

        Ok(LoadOutcome {
            success_count,
            errors,
        })
    }

    async fn connector_row(
        &self,
        tenant_id: Uuid,
        connector_id: Uuid,
        role: &str,
    ) -> Result<connector::Model, JobError> {
        self.connectors
            .find_by_tenant(tenant_id, connector_id)
            .await?
            .ok_or_else(|| {
                JobError::Validation(format!("{role} connector {connector_id} not found"))
            })
    }

    fn build_connector(
        &self,
        row: &connector::Model,
        cancellation: &JobCancellation,
    ) -> Result<Arc<dyn Connector>, JobError> {
        let config = self.connectors.decrypted_config(row).map_err(|_| {
            JobError::Validation(format!("connector {} credentials are unreadable", row.id))
        })?;

        let context = ConnectorContext {
            tenant_id: row.tenant_id,
            connector_id: row.id,
            config,
            limiter: self.limiter.clone(),
            cancellation: Some(cancellation.clone()),
            http: self.http.clone(),
        };

        self.registry
            .build(&row.connector_type, context)
            .map_err(|error| JobError::Validation(error.to_string()))
    }

    /// Conditionally move the job forward. Losing the race means someone else
    /// ended the job, which only a cancellation does.
    async fn advance(
        &self,
        job: &job::Model,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<(), JobError> {
        if self.jobs.transition(job.id, from, to, None).await? {
            self.emit(
                job.id,
                job.tenant_id,
                ProgressEventType::Status,
                ProgressData::default().with_status(to),
            );
            return Ok(());
        }

        match self.jobs.status_of(job.id).await? {
            Some(status) if status.is_failed_or_cancelled() => Err(JobError::Cancelled),
            other => Err(JobError::Internal(format!(
                "job {} left {from} unexpectedly (now {other:?})",
                job.id
            ))),
        }
    }

    fn finish(&self, job: &job::Model, status: JobStatus, percentage: u8) {
        self.emit(
            job.id,
            job.tenant_id,
            ProgressEventType::Complete,
            ProgressData {
                progress: percentage,
                phase: JobPhase::Done,
                ..Default::default()
            }
            .with_status(status),
        );
    }

    /// Persist and broadcast progress. Failures are logged, never raised.
    async fn publish_progress(&self, job: &job::Model, progress: &JobProgress) {
        if let Err(error) = self.jobs.update_progress(job.id, progress).await {
            warn!(job_id = %job.id, error = %error, "Failed to persist job progress");
        }
        self.emit(
            job.id,
            job.tenant_id,
            ProgressEventType::Progress,
            ProgressData::from_progress(progress),
        );
    }

    fn emit(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        event_type: ProgressEventType,
        data: ProgressData,
    ) {
        self.emitter
            .emit(ProgressEvent::new(job_id, tenant_id, event_type, data));
    }
}

/// Fold one destination chunk result into the batch-wide error map, keyed by
/// batch position, and return how many records of the chunk loaded.
///
/// A result that does not account for every record of the chunk exactly once
/// (errors pointing outside the chunk, duplicate indexes, or counts that do not
/// add up) cannot say which records landed, so every record of the chunk
/// without its own error is reported failed.
fn merge_chunk_outcome(
    chunk: &[usize],
    result: LoadOutcome,
    errors: &mut BTreeMap<usize, RecordError>,
) -> u64 {
    let mut chunk_errors: BTreeMap<usize, RecordError> = BTreeMap::new();
    let mut unattributed: Vec<String> = Vec::new();

    for mut error in result.errors {
        match chunk.get(error.index) {
            Some(&index) if !chunk_errors.contains_key(&index) => {
                error.index = index;
                chunk_errors.insert(index, error);
            }
            _ => unattributed.push(error.message),
        }
    }

    let consistent = unattributed.is_empty()
        && result.success_count + chunk_errors.len() as u64 == chunk.len() as u64;
    errors.append(&mut chunk_errors);
    if consistent {
        return result.success_count;
    }

    warn!(
        chunk_len = chunk.len(),
        reported_successes = result.success_count,
        unattributed = unattributed.len(),
        "Destination returned an inconsistent load result; failing the unaccounted records"
    );
    let message = match unattributed.first() {
        Some(detail) => format!("destination reported an inconsistent result: {detail}"),
        None => "destination reported an inconsistent result".to_string(),
    };
    for &index in chunk {
        errors
            .entry(index)
            .or_insert_with(|| RecordError::new(index, message.clone()));
    }
    0
}
