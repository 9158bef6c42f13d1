//! # Job Repository
//!
//! SeaORM operations for the `jobs` table. Status writes are conditional on
//! the status the caller last observed, so a concurrent cancellation is never
//! overwritten by a worker advancing the job.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::models::job::{
    ActiveModel, Column, Entity, JobConfig, JobKind, JobProgress, JobStatus, Model,
};

/// Fields required to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: Uuid,
    pub kind: JobKind,
    pub source_connector_id: Uuid,
    pub destination_connector_id: Option<Uuid>,
    pub entities: Vec<String>,
    pub config: JobConfig,
}

/// Failure recorded on a job when it ends in FAILED or CANCELLED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
}

/// Repository for job database operations
#[derive(Debug, Clone)]
pub struct JobRepository {
    db: DatabaseConnection,
}

impl JobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a new job in QUEUED state.
    pub async fn create(&self, new_job: NewJob) -> Result<Model, DbErr> {
        self.create_in(&self.db, new_job).await
    }

    /// Insert a new job using the given connection (used inside enqueue transactions).
    pub async fn create_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        new_job: NewJob,
    ) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let progress = JobProgress::new(new_job.entities.len());

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(new_job.tenant_id),
            job_type: Set(new_job.kind.as_str().to_string()),
            source_connector_id: Set(new_job.source_connector_id),
            destination_connector_id: Set(new_job.destination_connector_id),
            entities: Set(serde_json::json!(new_job.entities)),
            config: Set(serde_json::to_value(&new_job.config)
                .map_err(|e| DbErr::Custom(e.to_string()))?),
            status: Set(JobStatus::Queued.as_str().to_string()),
            progress: Set(serde_json::to_value(&progress)
                .map_err(|e| DbErr::Custom(e.to_string()))?),
            error_code: Set(None),
            error_message: Set(None),
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            updated_at: Set(now),
        };

        let result = job.insert(conn).await?;

        tracing::info!(
            tenant_id = %result.tenant_id,
            job_id = %result.id,
            job_type = %result.job_type,
            "Job created"
        );

        Ok(result)
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id).one(&self.db).await
    }

    /// Find a job by ID, ensuring it belongs to the specified tenant
    pub async fn find_by_tenant(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id)
            .filter(Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await
    }

    /// List a tenant's jobs, newest first
    pub async fn list_by_tenant(
        &self,
        tenant_id: Uuid,
        status: Option<JobStatus>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id);

        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }

        query.offset(offset).limit(limit).all(&self.db).await
    }

    /// Move a job from `from` to `to`. Returns false when the stored status no
    /// longer equals `from` (another writer got there first).
    pub async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        failure: Option<JobFailure>,
    ) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();

        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now));

        if from == JobStatus::Queued {
            update = update.col_expr(Column::StartedAt, Expr::value(now));
        }

        if to.is_final() || to == JobStatus::DataReady {
            update = update.col_expr(Column::CompletedAt, Expr::value(now));
        }

        if let Some(failure) = failure {
            update = update
                .col_expr(Column::ErrorCode, Expr::value(failure.code))
                .col_expr(Column::ErrorMessage, Expr::value(failure.message));
        }

        let result = update
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(from.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            tracing::info!(job_id = %job_id, from = %from, to = %to, "Job status transition");
        }

        Ok(result.rows_affected == 1)
    }

    /// Mark a job CANCELLED unless it is already terminal for its kind.
    ///
    /// Returns the job as stored after the attempt together with whether this
    /// call made the transition, or `None` if it does not exist for this tenant.
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<(Model, bool)>, DbErr> {
        // The worker may advance the job between our read and write; each
        // lost race means a forward step, so a handful of rounds suffices.
        for _ in 0..5 {
            let Some(job) = self.find_by_tenant(tenant_id, job_id).await? else {
                return Ok(None);
            };

            let (Ok(kind), Ok(status)) = (job.kind(), job.status()) else {
                return Ok(Some((job, false)));
            };

            if !status.can_transition_to(JobStatus::Cancelled, kind) {
                return Ok(Some((job, false)));
            }

            let cancelled = self
                .transition(
                    job_id,
                    status,
                    JobStatus::Cancelled,
                    Some(JobFailure {
                        code: "CANCELLED".to_string(),
                        message: "cancelled by user".to_string(),
                    }),
                )
                .await?;

            if cancelled {
                return Ok(self.find_by_id(job_id).await?.map(|job| (job, true)));
            }
        }

        Err(DbErr::Custom(format!(
            "job {job_id} changed status repeatedly while cancelling"
        )))
    }

    /// Persist structured progress.
    pub async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<(), DbErr> {
        let value = serde_json::to_value(progress).map_err(|e| DbErr::Custom(e.to_string()))?;

        Entity::update_many()
            .col_expr(Column::Progress, Expr::value(value))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(job_id))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Read only the current status of a job.
    pub async fn status_of(&self, job_id: Uuid) -> Result<Option<JobStatus>, DbErr> {
        let status: Option<String> = Entity::find_by_id(job_id)
            .select_only()
            .column(Column::Status)
            .into_tuple()
            .one(&self.db)
            .await?;

        Ok(status.and_then(|s| s.parse().ok()))
    }
}
