//! Job Queue
//!
//! Durable at-least-once delivery of job-start messages backed by the
//! `job_queue` table. A worker claims pending messages, heartbeats while it
//! runs the job, and finally acknowledges or fails the message. Failed
//! retriable messages come back after exponential backoff with jitter until
//! the attempt budget is spent.
//!
//! Every in-flight message carries a [`CancellationToken`] marker so a cancel
//! request served by the same process reaches the running job immediately.
//! The request is also persisted (`cancel_requested`) and picked up by the
//! next heartbeat when the job runs elsewhere.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::{Rng, thread_rng};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, QueryTrait, Set, TransactionTrait,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::models::queue_message::{
    self, ActiveModel, Column, Entity, STATUS_ACTIVE, STATUS_DEAD, STATUS_DONE, STATUS_PENDING,
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Database(#[from] DbErr),
    #[error("queue message {0} not found")]
    NotFound(Uuid),
}

/// One delivery of a job-start message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    /// 1-based delivery number
    pub attempt: u32,
    pub max_attempts: u32,
    /// Fires when cancellation of the job is requested
    pub marker: CancellationToken,
}

impl QueueMessage {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A message whose worker stopped heartbeating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    /// True when the attempt budget is spent and the message will not return
    pub dead: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a start message for `job_id`.
    async fn enqueue(&self, job_id: Uuid, tenant_id: Uuid) -> Result<Uuid, QueueError>;

    /// Claim up to `limit` due messages.
    async fn claim(&self, limit: usize) -> Result<Vec<QueueMessage>, QueueError>;

    /// Refresh the lease on an active message and pick up cancel requests.
    async fn heartbeat(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Acknowledge a message; it is never delivered again.
    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Fail a delivery. Retriable failures are redelivered after backoff while
    /// attempts remain; everything else is dead.
    async fn fail(
        &self,
        message: &QueueMessage,
        error: &str,
        retriable: bool,
    ) -> Result<(), QueueError>;

    /// Signal the in-flight message of `job_id`. Returns true when a marker in
    /// this process was fired.
    async fn signal_cancel(&self, job_id: Uuid) -> Result<bool, QueueError>;

    /// Requeue or kill active messages not heartbeated within `stall_after`.
    async fn recover_stalled(&self, stall_after: Duration) -> Result<Vec<StalledJob>, QueueError>;
}

/// Retry delay in seconds after `prior_failures` failed deliveries.
pub fn calculate_backoff(config: &WorkerConfig, prior_failures: u32) -> f64 {
    let base_seconds = config.backoff_base_seconds as f64;
    let max_seconds = config.backoff_max_seconds as f64;
    let exponent = i32::try_from(prior_failures).unwrap_or(i32::MAX);

    let backoff = (base_seconds * 2_f64.powi(exponent)).min(max_seconds);

    let jitter_range = config.jitter_factor * backoff;
    let jitter = if jitter_range > 0.0 {
        thread_rng().gen_range(0.0..jitter_range)
    } else {
        0.0
    };

    backoff + jitter
}

struct InFlight {
    attempt: u32,
    marker: CancellationToken,
}

/// Table-backed [`JobQueue`].
pub struct DbJobQueue {
    db: DatabaseConnection,
    config: WorkerConfig,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
}

impl DbJobQueue {
    pub fn new(db: DatabaseConnection, config: WorkerConfig) -> Self {
        Self {
            db,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a start message using `conn`, so job creation and enqueue can
    /// share one transaction.
    pub async fn enqueue_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Uuid, QueueError> {
        let now = Utc::now().fixed_offset();
        let message = ActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(job_id),
            tenant_id: Set(tenant_id),
            status: Set(STATUS_PENDING.to_string()),
            attempts: Set(0),
            max_attempts: Set(i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX)),
            available_at: Set(now),
            cancel_requested: Set(false),
            non_retriable: Set(false),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        debug!(job_id = %job_id, message_id = %message.id, "Job message enqueued");
        Ok(message.id)
    }

    fn track(&self, job_id: Uuid, attempt: u32) -> CancellationToken {
        let marker = CancellationToken::new();
        if let Ok(mut in_flight) = self.in_flight.lock() {
            // Replaces the marker of a stalled earlier delivery, if any
            in_flight.insert(
                job_id,
                InFlight {
                    attempt,
                    marker: marker.clone(),
                },
            );
        }
        marker
    }

    fn untrack(&self, message: &QueueMessage) {
        if let Ok(mut in_flight) = self.in_flight.lock()
            && in_flight
                .get(&message.job_id)
                .is_some_and(|entry| entry.attempt == message.attempt)
        {
            in_flight.remove(&message.job_id);
        }
    }

    fn cancel_in_process(&self, job_id: Uuid) -> bool {
        let Ok(in_flight) = self.in_flight.lock() else {
            return false;
        };
        match in_flight.get(&job_id) {
            Some(entry) => {
                entry.marker.cancel();
                true
            }
            None => false,
        }
    }

    fn message_from(&self, row: &queue_message::Model) -> QueueMessage {
        let attempt = u32::try_from(row.attempts).unwrap_or(0);
        let marker = self.track(row.job_id, attempt);
        if row.cancel_requested {
            marker.cancel();
        }
        QueueMessage {
            id: row.id,
            job_id: row.job_id,
            tenant_id: row.tenant_id,
            attempt,
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            marker,
        }
    }
}

#[async_trait]
impl JobQueue for DbJobQueue {
    async fn enqueue(&self, job_id: Uuid, tenant_id: Uuid) -> Result<Uuid, QueueError> {
        self.enqueue_in(&self.db, job_id, tenant_id).await
    }

    async fn claim(&self, limit: usize) -> Result<Vec<QueueMessage>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        // One active delivery per job at a time
        let eligible: Vec<Uuid> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(STATUS_PENDING))
            .filter(Column::AvailableAt.lte(now))
            .filter(
                Column::JobId.not_in_subquery(
                    Entity::find()
                        .select_only()
                        .column(Column::JobId)
                        .filter(Column::Status.eq(STATUS_ACTIVE))
                        .into_query(),
                ),
            )
            .order_by_asc(Column::AvailableAt)
            .order_by_asc(Column::CreatedAt)
            .limit(limit as u64)
            .into_tuple()
            .all(&txn)
            .await?;

        if eligible.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        let update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_ACTIVE))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.is_in(eligible.clone()))
            .filter(Column::Status.eq(STATUS_PENDING))
            .exec(&txn)
            .await?;

        let claimed = if update.rows_affected > 0 {
            Entity::find()
                .filter(Column::Id.is_in(eligible))
                .filter(Column::Status.eq(STATUS_ACTIVE))
                .filter(Column::UpdatedAt.eq(now))
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;

        let messages: Vec<QueueMessage> = claimed
            .iter()
            .map(|row| self.message_from(row))
            .collect();

        if !messages.is_empty() {
            info!(count = messages.len(), "Claimed job messages");
        }

        Ok(messages)
    }

    async fn heartbeat(&self, message: &QueueMessage) -> Result<(), QueueError> {
        Entity::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(message.id))
            .filter(Column::Status.eq(STATUS_ACTIVE))
            .filter(Column::Attempts.eq(message.attempt as i32))
            .exec(&self.db)
            .await?;

        let cancel_requested: Option<bool> = Entity::find_by_id(message.id)
            .select_only()
            .column(Column::CancelRequested)
            .into_tuple()
            .one(&self.db)
            .await?;

        match cancel_requested {
            Some(true) if !message.marker.is_cancelled() => {
                info!(job_id = %message.job_id, "Cancel request observed on heartbeat");
                message.marker.cancel();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(QueueError::NotFound(message.id)),
        }
    }

    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_DONE))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(message.id))
            .filter(Column::Attempts.eq(message.attempt as i32))
            .exec(&self.db)
            .await?;

        self.untrack(message);
        debug!(job_id = %message.job_id, message_id = %message.id, "Job message acknowledged");
        Ok(())
    }

    async fn fail(
        &self,
        message: &QueueMessage,
        error: &str,
        retriable: bool,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let redeliver = retriable && !message.is_last_attempt();

        let mut update = Entity::update_many()
            .col_expr(Column::LastError, Expr::value(error))
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()));

        if redeliver {
            let prior_failures = message.attempt.saturating_sub(1);
            let backoff_seconds = calculate_backoff(&self.config, prior_failures);
            let available_at =
                now + chrono::Duration::milliseconds((backoff_seconds * 1000.0) as i64);

            update = update
                .col_expr(Column::Status, Expr::value(STATUS_PENDING))
                .col_expr(Column::AvailableAt, Expr::value(available_at.fixed_offset()));

            warn!(
                job_id = %message.job_id,
                attempt = message.attempt,
                backoff_seconds,
                error,
                "Job delivery failed; redelivering after backoff"
            );
        } else {
            update = update
                .col_expr(Column::Status, Expr::value(STATUS_DEAD))
                .col_expr(Column::NonRetriable, Expr::value(!retriable));

            warn!(
                job_id = %message.job_id,
                attempt = message.attempt,
                retriable,
                error,
                "Job message dead"
            );
        }

        update
            .filter(Column::Id.eq(message.id))
            .filter(Column::Attempts.eq(message.attempt as i32))
            .exec(&self.db)
            .await?;

        self.untrack(message);
        Ok(())
    }

    async fn signal_cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let result = Entity::update_many()
            .col_expr(Column::CancelRequested, Expr::value(true))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Status.is_in([STATUS_PENDING, STATUS_ACTIVE]))
            .exec(&self.db)
            .await?;

        let signalled = self.cancel_in_process(job_id);
        debug!(
            job_id = %job_id,
            rows = result.rows_affected,
            signalled,
            "Cancel signalled to job queue"
        );
        Ok(signalled)
    }

    async fn recover_stalled(&self, stall_after: Duration) -> Result<Vec<StalledJob>, QueueError> {
        let now = Utc::now();
        let stall_after =
            chrono::Duration::from_std(stall_after).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = (now - stall_after).fixed_offset();

        let stalled = Entity::find()
            .filter(Column::Status.eq(STATUS_ACTIVE))
            .filter(Column::UpdatedAt.lt(cutoff))
            .all(&self.db)
            .await?;

        let mut recovered = Vec::with_capacity(stalled.len());
        for row in stalled {
            let dead = row.attempts >= row.max_attempts;
            let next_status = if dead { STATUS_DEAD } else { STATUS_PENDING };

            let result = Entity::update_many()
                .col_expr(Column::Status, Expr::value(next_status))
                .col_expr(Column::AvailableAt, Expr::value(now.fixed_offset()))
                .col_expr(Column::LastError, Expr::value("job stalled"))
                .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
                .filter(Column::Id.eq(row.id))
                .filter(Column::Status.eq(STATUS_ACTIVE))
                .filter(Column::UpdatedAt.eq(row.updated_at))
                .exec(&self.db)
                .await?;

            if result.rows_affected == 0 {
                continue;
            }

            warn!(
                job_id = %row.job_id,
                attempts = row.attempts,
                dead,
                "Recovered stalled job message"
            );
            recovered.push(StalledJob {
                job_id: row.job_id,
                tenant_id: row.tenant_id,
                dead,
            });
        }

        Ok(recovered)
    }
}
