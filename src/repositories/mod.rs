//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM operations
//! for database entities, providing a clean API for data access with tenant-aware methods.

pub mod connector;
pub mod extracted_batch;
pub mod job;
pub mod load_result;

pub use connector::{ConnectorRepository, ConnectorRepositoryError, NewConnector};
pub use extracted_batch::{ExtractedBatchRepository, NewBatch};
pub use job::{JobFailure, JobRepository, NewJob};
pub use load_result::LoadResultRepository;
