//! Migration to create the job_queue table.
//!
//! Each row is one delivery envelope for a job-start message. The worker claims
//! pending rows, and failed deliveries are re-queued with backoff until the
//! attempt budget runs out.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobQueue::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(JobQueue::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(JobQueue::JobId).uuid().not_null())
                    .col(ColumnDef::new(JobQueue::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(JobQueue::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(JobQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobQueue::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(JobQueue::AvailableAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(JobQueue::CancelRequested)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(JobQueue::NonRetriable)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(JobQueue::LastError).text().null())
                    .col(
                        ColumnDef::new(JobQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(JobQueue::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_queue_job_id")
                            .from(JobQueue::Table, JobQueue::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_job_queue_status_available ON job_queue (status, available_at)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_queue_job_id")
                    .table(JobQueue::Table)
                    .col(JobQueue::JobId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_queue_status_available")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_job_queue_job_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(JobQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobQueue {
    Table,
    Id,
    JobId,
    TenantId,
    Status,
    Attempts,
    MaxAttempts,
    AvailableAt,
    CancelRequested,
    NonRetriable,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
}
