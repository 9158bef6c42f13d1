//! # LoadResult Repository

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

use crate::connectors::LoadOutcome;
use crate::models::load_result::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct LoadResultRepository {
    db: DatabaseConnection,
}

impl LoadResultRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Persist the outcome of loading one batch.
    pub async fn record(
        &self,
        batch: &crate::models::extracted_batch::Model,
        destination_system: &str,
        outcome: &LoadOutcome,
    ) -> Result<Model, DbErr> {
        let errors =
            serde_json::to_value(&outcome.errors).map_err(|e| DbErr::Custom(e.to_string()))?;

        ActiveModel {
            id: Set(Uuid::new_v4()),
            batch_id: Set(batch.id),
            job_id: Set(batch.job_id),
            tenant_id: Set(batch.tenant_id),
            destination_system: Set(destination_system.to_string()),
            success_count: Set(outcome.success_count as i32),
            failure_count: Set(outcome.failure_count() as i32),
            errors: Set(errors),
            loaded_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await
    }

    pub async fn list_by_job(&self, job_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::LoadedAt)
            .all(&self.db)
            .await
    }
}
