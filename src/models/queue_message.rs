//! Job queue entity model
//!
//! Rows of the `job_queue` table backing the at-least-once job queue.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Waiting for a worker.
pub const STATUS_PENDING: &str = "pending";
/// Claimed by a worker.
pub const STATUS_ACTIVE: &str = "active";
/// Acknowledged.
pub const STATUS_DONE: &str = "done";
/// Never delivered again.
pub const STATUS_DEAD: &str = "dead";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "job_queue")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    pub tenant_id: Uuid,

    /// pending, active, done or dead
    pub status: String,

    /// Deliveries so far
    pub attempts: i32,

    pub max_attempts: i32,

    /// Earliest time the message may be claimed
    pub available_at: DateTimeWithTimeZone,

    pub cancel_requested: bool,

    pub non_retriable: bool,

    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    /// Doubles as the heartbeat timestamp while active
    pub updated_at: DateTimeWithTimeZone,
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
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
