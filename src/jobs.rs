//! Job submission and cancellation
//!
//! The entry points the API uses to start and stop jobs. Submission validates
//! the job against the connector types involved and then writes the job row
//! and its queue message in one transaction, so a job is never QUEUED without
//! a message to run it. Cancellation persists the terminal status first and
//! only then nudges the running worker.

use std::sync::Arc;

use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, TransactionTrait,
};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cancellation::CancellationOracle;
use crate::connectors::Registry;
use crate::models::{JobConfig, JobKind, JobStatus, connector, job};
use crate::orchestrator::{JobError, validate_job};
use crate::progress::{ProgressData, ProgressEmitter, ProgressEvent, ProgressEventType};
use crate::queue::{DbJobQueue, JobQueue, QueueError};
use crate::repositories::{JobRepository, NewJob};

/// A job as requested by an operator.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub tenant_id: Uuid,
    pub kind: JobKind,
    pub source_connector_id: Uuid,
    pub destination_connector_id: Option<Uuid>,
    pub entities: Vec<String>,
    pub config: JobConfig,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(JobError),
    #[error("connector {0} not found")]
    ConnectorNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job is now CANCELLED
    Cancelled(job::Model),
    /// The job had already finished; nothing changed
    AlreadyFinished(job::Model),
}

pub struct JobService {
    db: DatabaseConnection,
    jobs: JobRepository,
    queue: Arc<DbJobQueue>,
    registry: Arc<Registry>,
    oracle: Arc<CancellationOracle>,
    emitter: Arc<dyn ProgressEmitter>,
}

impl JobService {
    pub fn new(
        db: DatabaseConnection,
        queue: Arc<DbJobQueue>,
        registry: Arc<Registry>,
        oracle: Arc<CancellationOracle>,
        emitter: Arc<dyn ProgressEmitter>,
    ) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            db,
            queue,
            registry,
            oracle,
            emitter,
        }
    }

    /// Validate and enqueue a job. Nothing is written when validation fails.
    #[instrument(skip_all, fields(tenant_id = %submission.tenant_id, job_type = %submission.kind))]
    pub async fn submit(&self, submission: JobSubmission) -> Result<job::Model, SubmitError> {
        let source = self
            .connector(submission.tenant_id, submission.source_connector_id)
            .await?;
        let destination = match submission.destination_connector_id {
            Some(id) => Some(self.connector(submission.tenant_id, id).await?),
            None => None,
        };

        let source_meta = self
            .registry
            .get_metadata(&source.connector_type)
            .map_err(|err| SubmitError::Invalid(JobError::Validation(err.to_string())))?;
        let destination_meta = match &destination {
            Some(row) => Some(
                self.registry
                    .get_metadata(&row.connector_type)
                    .map_err(|err| SubmitError::Invalid(JobError::Validation(err.to_string())))?,
            ),
            None => None,
        };

        validate_job(
            submission.kind,
            &submission.entities,
            &submission.config,
            source_meta,
            destination_meta,
        )
        .map_err(SubmitError::Invalid)?;

        let txn = self.db.begin().await?;
        let created = self
            .jobs
            .create_in(
                &txn,
                NewJob {
                    tenant_id: submission.tenant_id,
                    kind: submission.kind,
                    source_connector_id: submission.source_connector_id,
                    destination_connector_id: submission.destination_connector_id,
                    entities: submission.entities,
                    config: submission.config,
                },
            )
            .await?;
        self.queue
            .enqueue_in(&txn, created.id, created.tenant_id)
            .await?;
        txn.commit().await?;

        info!(job_id = %created.id, "Job submitted");
        self.emitter.emit(ProgressEvent::new(
            created.id,
            created.tenant_id,
            ProgressEventType::Status,
            ProgressData::default().with_status(JobStatus::Queued),
        ));

        Ok(created)
    }

    /// Cancel a job. Succeeds once the CANCELLED status is persisted; the
    /// ephemeral flag and the queue signal are best effort.
    ///
    /// Returns `None` when the job does not exist for this tenant.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<CancelOutcome>, DbErr> {
        let Some((stored, transitioned)) = self.jobs.cancel(tenant_id, job_id).await? else {
            return Ok(None);
        };

        if !transitioned {
            return Ok(Some(CancelOutcome::AlreadyFinished(stored)));
        }

        self.oracle.set_flag(job_id).await;
        if let Err(err) = self.queue.signal_cancel(job_id).await {
            warn!(job_id = %job_id, error = %err, "Failed to signal cancellation to the queue");
        }

        info!(job_id = %job_id, "Job cancelled");
        self.emitter.emit(ProgressEvent::new(
            job_id,
            tenant_id,
            ProgressEventType::Status,
            ProgressData::from_progress(&stored.job_progress())
                .with_status(JobStatus::Cancelled)
                .with_message("cancelled by user"),
        ));

        Ok(Some(CancelOutcome::Cancelled(stored)))
    }

    async fn connector(&self, tenant_id: Uuid, id: Uuid) -> Result<connector::Model, SubmitError> {
        connector::Entity::find_by_id(id)
            .filter(connector::Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await?
            .ok_or(SubmitError::ConnectorNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CancellationConfig, WorkerConfig};
    use crate::connectors::ConnectorKind;
    use crate::crypto::CryptoKey;
    use crate::db::test_db;
    use crate::kv::MemoryKvStore;
    use crate::models::queue_message;
    use crate::progress::BroadcastEmitter;
    use crate::repositories::{ConnectorRepository, NewConnector};
    use serde_json::json;

    struct Fixture {
        service: JobService,
        emitter: Arc<BroadcastEmitter>,
        queue: Arc<DbJobQueue>,
        db: DatabaseConnection,
        tenant_id: Uuid,
        freshservice: Uuid,
        servicenow: Uuid,
    }

    async fn fixture() -> Fixture {
        let db = test_db().await;
        let tenant_id = Uuid::new_v4();
        let connectors =
            ConnectorRepository::new(db.clone(), CryptoKey::new(vec![7u8; 32]).unwrap());

        let freshservice = connectors
            .create(
                &ConnectorKind::Freshservice.metadata(),
                NewConnector {
                    tenant_id,
                    name: "helpdesk".into(),
                    config: json!({"domain": "acme", "apiKey": "secret"}),
                },
            )
            .await
            .unwrap()
            .id;
        let servicenow = connectors
            .create(
                &ConnectorKind::ServiceNow.metadata(),
                NewConnector {
                    tenant_id,
                    name: "target".into(),
                    config: json!({
                        "instanceUrl": "https://acme.service-now.com",
                        "clientId": "id",
                        "clientSecret": "secret",
                        "grantType": "client_credentials"
                    }),
                },
            )
            .await
            .unwrap()
            .id;

        let store = Arc::new(MemoryKvStore::new(64));
        let jobs: Arc<dyn crate::cancellation::JobStatusSource> =
            Arc::new(JobRepository::new(db.clone()));
        let oracle = Arc::new(CancellationOracle::new(
            store,
            jobs,
            &CancellationConfig::default(),
        ));
        let queue = Arc::new(DbJobQueue::new(db.clone(), WorkerConfig::default()));
        let emitter = Arc::new(BroadcastEmitter::new(16));
        let service = JobService::new(
            db.clone(),
            queue.clone(),
            Arc::new(crate::connectors::Registry::with_builtin()),
            oracle,
            emitter.clone(),
        );

        Fixture {
            service,
            emitter,
            queue,
            db,
            tenant_id,
            freshservice,
            servicenow,
        }
    }

    fn extraction(fixture: &Fixture, entities: &[&str]) -> JobSubmission {
        JobSubmission {
            tenant_id: fixture.tenant_id,
            kind: JobKind::Extraction,
            source_connector_id: fixture.freshservice,
            destination_connector_id: None,
            entities: entities.iter().map(|e| e.to_string()).collect(),
            config: JobConfig::default(),
        }
    }

    #[tokio::test]
    async fn submit_creates_queued_job_and_message() {
        let fixture = fixture().await;
        let mut events = fixture.emitter.subscribe();

        let job = fixture
            .service
            .submit(extraction(&fixture, &["tickets"]))
            .await
            .unwrap();

        assert_eq!(job.status, "QUEUED");
        let messages = queue_message::Entity::find().all(&fixture.db).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].job_id, job.id);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, ProgressEventType::Status);
        assert_eq!(event.data.status, Some(JobStatus::Queued));
    }

    #[tokio::test]
    async fn invalid_job_writes_nothing() {
        let fixture = fixture().await;

        let err = fixture
            .service
            .submit(extraction(&fixture, &["widgets"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Invalid(_)));

        let mut migration = extraction(&fixture, &["tickets"]);
        migration.kind = JobKind::Migration;
        migration.destination_connector_id = Some(fixture.servicenow);
        // ServiceNow has no "tickets" table to load into
        assert!(fixture.service.submit(migration).await.is_err());

        assert!(crate::models::Job::find().all(&fixture.db).await.unwrap().is_empty());
        assert!(queue_message::Entity::find().all(&fixture.db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_tenants_connectors_are_not_found() {
        let fixture = fixture().await;
        let mut submission = extraction(&fixture, &["tickets"]);
        submission.tenant_id = Uuid::new_v4();

        let err = fixture.service.submit(submission).await.unwrap_err();
        assert!(matches!(err, SubmitError::ConnectorNotFound(id) if id == fixture.freshservice));
    }

    #[tokio::test]
    async fn cancel_persists_status_and_signals_queue() {
        let fixture = fixture().await;
        let job = fixture
            .service
            .submit(extraction(&fixture, &["tickets"]))
            .await
            .unwrap();

        let claimed = fixture.queue.claim(1).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let outcome = fixture
            .service
            .cancel(fixture.tenant_id, job.id)
            .await
            .unwrap()
            .unwrap();
        let CancelOutcome::Cancelled(stored) = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(stored.status, "CANCELLED");
        assert_eq!(stored.error_code.as_deref(), Some("CANCELLED"));
        assert!(claimed[0].marker.is_cancelled());

        // A second request finds the job already terminal
        let again = fixture
            .service
            .cancel(fixture.tenant_id, job.id)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(again, CancelOutcome::AlreadyFinished(_)));
    }

    #[tokio::test]
    async fn repeated_cancel_announces_once() {
        let fixture = fixture().await;
        let job = fixture
            .service
            .submit(extraction(&fixture, &["tickets"]))
            .await
            .unwrap();
        let mut events = fixture.emitter.subscribe();

        for _ in 0..2 {
            fixture
                .service
                .cancel(fixture.tenant_id, job.id)
                .await
                .unwrap()
                .unwrap();
        }

        let mut cancelled = 0;
        while let Ok(event) = events.try_recv() {
            if event.job_id == job.id && event.data.status == Some(JobStatus::Cancelled) {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 1);

        let stored = JobRepository::new(fixture.db.clone())
            .find_by_id(job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "CANCELLED");
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_none() {
        let fixture = fixture().await;
        assert!(
            fixture
                .service
                .cancel(fixture.tenant_id, Uuid::new_v4())
                .await
                .unwrap()
                .is_none()
        );
    }
}
