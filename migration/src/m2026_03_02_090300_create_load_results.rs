//! Migration to create the load_results table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LoadResults::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(LoadResults::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(LoadResults::BatchId).uuid().not_null())
                    .col(ColumnDef::new(LoadResults::JobId).uuid().not_null())
                    .col(ColumnDef::new(LoadResults::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(LoadResults::DestinationSystem)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LoadResults::SuccessCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LoadResults::FailureCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(LoadResults::Errors).json_binary().not_null())
                    .col(
                        ColumnDef::new(LoadResults::LoadedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_load_results_batch_id")
                            .from(LoadResults::Table, LoadResults::BatchId)
                            .to(ExtractedBatches::Table, ExtractedBatches::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_load_results_job_id")
                    .table(LoadResults::Table)
                    .col(LoadResults::JobId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_load_results_job_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(LoadResults::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LoadResults {
    Table,
    Id,
    BatchId,
    JobId,
    TenantId,
    DestinationSystem,
    SuccessCount,
    FailureCount,
    Errors,
    LoadedAt,
}

#[derive(DeriveIden)]
enum ExtractedBatches {
    Table,
    Id,
}
