//! # Data Models
//!
//! SeaORM entities for connectors, jobs, extracted batches, load results and
//! the job queue.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connector;
pub mod extracted_batch;
pub mod job;
pub mod load_result;
pub mod queue_message;

pub use connector::Entity as Connector;
pub use extracted_batch::Entity as ExtractedBatch;
pub use job::Entity as Job;
pub use job::{JobConfig, JobKind, JobPhase, JobProgress, JobStatus};
pub use load_result::Entity as LoadResult;
pub use queue_message::Entity as QueueMessage;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "itsm-bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
