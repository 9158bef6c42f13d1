//! Migration to create the jobs table.
//!
//! A job is one extraction, loading or migration run. Rows are never deleted;
//! a job ends by reaching a terminal status.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Jobs::JobType).text().not_null())
                    .col(ColumnDef::new(Jobs::SourceConnectorId).uuid().not_null())
                    .col(ColumnDef::new(Jobs::DestinationConnectorId).uuid().null())
                    .col(ColumnDef::new(Jobs::Entities).json_binary().not_null())
                    .col(ColumnDef::new(Jobs::Config).json_binary().not_null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .text()
                            .not_null()
                            .default("QUEUED"),
                    )
                    .col(ColumnDef::new(Jobs::Progress).json_binary().not_null())
                    .col(ColumnDef::new(Jobs::ErrorCode).text().null())
                    .col(ColumnDef::new(Jobs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(Jobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Jobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Jobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_jobs_source_connector_id")
                            .from(Jobs::Table, Jobs::SourceConnectorId)
                            .to(Connectors::Table, Connectors::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_tenant_created")
                    .table(Jobs::Table)
                    .col(Jobs::TenantId)
                    .col(Jobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_jobs_tenant_created").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    TenantId,
    JobType,
    SourceConnectorId,
    DestinationConnectorId,
    Entities,
    Config,
    Status,
    Progress,
    ErrorCode,
    ErrorMessage,
    CreatedAt,
    StartedAt,
    CompletedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Connectors {
    Table,
    Id,
}
