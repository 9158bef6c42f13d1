//! # ExtractedBatch Repository
//!
//! One batch per (job, entity type). Re-running extraction for the same pair
//! replaces the earlier batch, which keeps redelivered jobs idempotent.

use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::extracted_batch::{ActiveModel, Column, Entity, Model};

/// Records extracted for one entity type, ready to persist.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub entity_type: String,
    pub batch_sequence: i32,
    pub source_system: String,
    pub records: Vec<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct ExtractedBatchRepository {
    db: DatabaseConnection,
    retention: Duration,
}

impl ExtractedBatchRepository {
    pub fn new(db: DatabaseConnection, retention_days: u32) -> Self {
        Self {
            db,
            retention: Duration::days(i64::from(retention_days)),
        }
    }

    /// Store a batch, replacing any earlier batch for the same job and entity type.
    pub async fn replace(&self, batch: NewBatch) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let record_count = i32::try_from(batch.records.len())
            .map_err(|_| DbErr::Custom("batch exceeds i32::MAX records".to_string()))?;

        let txn = self.db.begin().await?;

        Entity::delete_many()
            .filter(Column::JobId.eq(batch.job_id))
            .filter(Column::EntityType.eq(batch.entity_type.clone()))
            .exec(&txn)
            .await?;

        let model = ActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(batch.job_id),
            tenant_id: Set(batch.tenant_id),
            entity_type: Set(batch.entity_type),
            batch_sequence: Set(batch.batch_sequence),
            source_system: Set(batch.source_system),
            raw_records: Set(JsonValue::Array(batch.records)),
            transformed_records: Set(None),
            record_count: Set(record_count),
            extracted_at: Set(now),
            expires_at: Set(now + self.retention),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        Ok(model)
    }

    /// Attach transformed records to a batch.
    pub async fn set_transformed(
        &self,
        batch_id: Uuid,
        transformed: Vec<JsonValue>,
    ) -> Result<(), DbErr> {
        Entity::update_many()
            .col_expr(
                Column::TransformedRecords,
                Expr::value(JsonValue::Array(transformed)),
            )
            .filter(Column::Id.eq(batch_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Batches of a job in entity order.
    pub async fn list_by_job(&self, job_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::BatchSequence)
            .all(&self.db)
            .await
    }

    pub async fn find_by_id(&self, batch_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(batch_id).one(&self.db).await
    }

    /// Delete batches whose retention deadline has passed. Returns the number removed.
    pub async fn delete_expired(&self) -> Result<u64, DbErr> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        // load_results cascade in Postgres; SQLite test databases run with
        // foreign keys off, so remove them explicitly.
        let expired: Vec<Uuid> = Entity::find()
            .filter(Column::ExpiresAt.lte(now))
            .all(&txn)
            .await?
            .into_iter()
            .map(|batch| batch.id)
            .collect();

        if expired.is_empty() {
            txn.commit().await?;
            return Ok(0);
        }

        crate::models::load_result::Entity::delete_many()
            .filter(crate::models::load_result::Column::BatchId.is_in(expired.clone()))
            .exec(&txn)
            .await?;

        let result = Entity::delete_many()
            .filter(Column::Id.is_in(expired))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(result.rows_affected)
    }
}
