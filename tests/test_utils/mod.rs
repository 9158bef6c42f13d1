//! Test utilities shared by the integration suites.
//!
//! In-memory SQLite with the real migrations, a ready-to-run configuration
//! and helpers to register connectors and collect progress events.

#![allow(dead_code)]

use anyhow::Result;
use itsm_bridge::config::AppConfig;
use itsm_bridge::connectors::Registry;
use itsm_bridge::models::{JobStatus, connector};
use itsm_bridge::progress::{ProgressEvent, ProgressEventType};
use itsm_bridge::repositories::{ConnectorRepository, NewConnector};
use itsm_bridge::services::Services;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const OPERATOR_TOKEN: &str = "integration-operator-token";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    // Fixtures insert rows in dependency order, so keep SQLite honest
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = ON".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Configuration with credentials set and no pauses between detail batches.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![9u8; 32]),
        ..Default::default()
    };
    config.extraction.detail_batch_delay_ms = 0;
    config
}

pub async fn services() -> Result<Services> {
    services_with(Registry::with_builtin()).await
}

pub async fn services_with(registry: Registry) -> Result<Services> {
    let db = setup_test_db().await?;
    Services::with_registry(test_config(), db, registry)
}

/// Registers a connector of a type known to `services`' registry.
pub async fn create_connector(
    services: &Services,
    tenant_id: Uuid,
    connector_type: &str,
    config: Value,
) -> Result<connector::Model> {
    let state = &services.state;
    let metadata = state.registry.get_metadata(connector_type)?.clone();
    let repository = ConnectorRepository::new(state.db.clone(), state.crypto_key.clone());
    let model = repository
        .create(
            &metadata,
            NewConnector {
                tenant_id,
                name: format!("{connector_type} test"),
                config,
            },
        )
        .await?;
    Ok(model)
}

/// Everything already buffered on `receiver`.
pub fn drain_events(receiver: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

/// Statuses announced by status events, in order.
pub fn status_path(events: &[ProgressEvent], job_id: Uuid) -> Vec<JobStatus> {
    events
        .iter()
        .filter(|event| event.job_id == job_id && event.event_type == ProgressEventType::Status)
        .filter_map(|event| event.data.status)
        .collect()
}
