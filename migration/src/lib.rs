//! Database migrations for the ITSM bridge.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_03_02_090000_create_connectors;
mod m2026_03_02_090100_create_jobs;
mod m2026_03_02_090200_create_extracted_batches;
mod m2026_03_02_090300_create_load_results;
mod m2026_03_02_090400_create_job_queue;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_03_02_090000_create_connectors::Migration),
            Box::new(m2026_03_02_090100_create_jobs::Migration),
            Box::new(m2026_03_02_090200_create_extracted_batches::Migration),
            Box::new(m2026_03_02_090300_create_load_results::Migration),
            Box::new(m2026_03_02_090400_create_job_queue::Migration),
        ]
    }
}
