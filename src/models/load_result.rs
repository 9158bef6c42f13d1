//! LoadResult entity model
//!
//! Outcome of loading one extracted batch into a destination.
//! `success_count + failure_count` equals the batch's `record_count`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "load_results")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub batch_id: Uuid,

    pub job_id: Uuid,

    pub tenant_id: Uuid,

    /// Connector type of the destination
    pub destination_system: String,

    pub success_count: i32,

    pub failure_count: i32,

    /// JSON array of per-record errors
    #[sea_orm(column_type = "JsonBinary")]
    pub errors: JsonValue,

    pub loaded_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::extracted_batch::Entity",
        from = "Column::BatchId",
        to = "super::extracted_batch::Column::Id",
        on_delete = "Cascade"
    )]
    ExtractedBatch,
}

impl Related<super::extracted_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExtractedBatch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
