//! ExtractedBatch entity model
//!
//! One entity type's extracted records for one job. `record_count` always
//! equals the length of `raw_records`; `transformed_records` stays null until
//! the transform phase runs.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "extracted_batches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    pub tenant_id: Uuid,

    pub entity_type: String,

    /// Position of the entity type within the job's entity list
    pub batch_sequence: i32,

    /// Connector type the records were extracted from
    pub source_system: String,

    /// JSON array of records as returned by the source
    #[sea_orm(column_type = "JsonBinary")]
    pub raw_records: JsonValue,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub transformed_records: Option<JsonValue>,

    pub record_count: i32,

    pub extracted_at: DateTimeWithTimeZone,

    /// Retention deadline; the reaper deletes the batch after this instant
    pub expires_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job::Entity",
        from = "Column::JobId",
        to = "super::job::Column::Id",
        on_delete = "Cascade"
    )]
    Job,
    #[sea_orm(has_many = "super::load_result::Entity")]
    LoadResults,
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl Related<super::load_result::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LoadResults.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn raw(&self) -> Vec<JsonValue> {
        self.raw_records.as_array().cloned().unwrap_or_default()
    }

    /// Transformed records if the transform phase ran, else the raw records.
    pub fn records_for_load(&self) -> Vec<JsonValue> {
        self.transformed_records
            .as_ref()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_else(|| self.raw())
    }
}
