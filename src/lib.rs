//! # ITSM Bridge
//!
//! Moves records between ITSM platforms. Operators submit extraction,
//! loading or migration jobs; a worker drives each job through its state
//! machine, pulling records from a source connector under a shared rate limit
//! and pushing them into a destination connector, while progress streams out
//! to subscribers and cancellation is honored at every checkpoint.

pub mod auth;
pub mod cancellation;
pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod kv;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod rate_limit;
pub mod reaper;
pub mod repositories;
pub mod server;
pub mod services;
pub mod telemetry;
pub mod worker;
pub use migration;
