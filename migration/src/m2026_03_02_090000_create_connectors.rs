//! Migration to create the connectors table.
//!
//! A connector row binds a tenant to one external platform instance. Sensitive
//! configuration values are stored encrypted inside the `config` document.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connectors::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Connectors::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Connectors::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Connectors::ConnectorType).text().not_null())
                    .col(ColumnDef::new(Connectors::Name).text().not_null())
                    .col(ColumnDef::new(Connectors::Config).json_binary().not_null())
                    .col(
                        ColumnDef::new(Connectors::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connectors::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connectors_tenant_type")
                    .table(Connectors::Table)
                    .col(Connectors::TenantId)
                    .col(Connectors::ConnectorType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_connectors_tenant_type").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Connectors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connectors {
    Table,
    Id,
    TenantId,
    ConnectorType,
    Name,
    Config,
    CreatedAt,
    UpdatedAt,
}
