//! Migration to create the extracted_batches table.
//!
//! One row per (job, entity type) holding raw and transformed records until
//! the retention reaper removes it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExtractedBatches::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExtractedBatches::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExtractedBatches::JobId).uuid().not_null())
                    .col(ColumnDef::new(ExtractedBatches::TenantId).uuid().not_null())
                    .col(ColumnDef::new(ExtractedBatches::EntityType).text().not_null())
                    .col(
                        ColumnDef::new(ExtractedBatches::BatchSequence)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ExtractedBatches::SourceSystem).text().not_null())
                    .col(
                        ColumnDef::new(ExtractedBatches::RawRecords)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExtractedBatches::TransformedRecords)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExtractedBatches::RecordCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExtractedBatches::ExtractedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExtractedBatches::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_extracted_batches_job_id")
                            .from(ExtractedBatches::Table, ExtractedBatches::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_extracted_batches_job_entity")
                    .table(ExtractedBatches::Table)
                    .col(ExtractedBatches::JobId)
                    .col(ExtractedBatches::EntityType)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_extracted_batches_expires_at")
                    .table(ExtractedBatches::Table)
                    .col(ExtractedBatches::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_extracted_batches_job_entity")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_extracted_batches_expires_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ExtractedBatches::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExtractedBatches {
    Table,
    Id,
    JobId,
    TenantId,
    EntityType,
    BatchSequence,
    SourceSystem,
    RawRecords,
    TransformedRecords,
    RecordCount,
    ExtractedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
}
