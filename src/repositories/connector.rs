//! # Connector Repository
//!
//! Tenant-scoped CRUD for configured connectors. Secret fields named by the
//! connector type's metadata are encrypted on the way in and decrypted only
//! when a connector instance is being built.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::connectors::ConnectorMetadata;
use crate::crypto::{
    CryptoError, CryptoKey, SecretContext, decrypt_config_secrets, encrypt_config_secrets,
};
use crate::models::connector::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Error)]
pub enum ConnectorRepositoryError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("connector secret could not be processed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("connector config must be a JSON object")]
    InvalidConfig,
    #[error("missing required config fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
}

/// Fields required to register a connector.
#[derive(Debug, Clone)]
pub struct NewConnector {
    pub tenant_id: Uuid,
    pub name: String,
    pub config: JsonValue,
}

#[derive(Debug, Clone)]
pub struct ConnectorRepository {
    db: DatabaseConnection,
    crypto_key: CryptoKey,
}

impl ConnectorRepository {
    pub fn new(db: DatabaseConnection, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Validate and store a connector, encrypting its secret fields.
    pub async fn create(
        &self,
        metadata: &ConnectorMetadata,
        new_connector: NewConnector,
    ) -> Result<Model, ConnectorRepositoryError> {
        if !new_connector.config.is_object() {
            return Err(ConnectorRepositoryError::InvalidConfig);
        }

        let missing = metadata.missing_required(&new_connector.config);
        if !missing.is_empty() {
            return Err(ConnectorRepositoryError::MissingFields(missing));
        }

        let id = Uuid::new_v4();
        let mut config = new_connector.config;
        encrypt_config_secrets(
            &self.crypto_key,
            SecretContext {
                tenant_id: new_connector.tenant_id,
                connector_type: &metadata.connector_type,
                connector_id: id,
            },
            &mut config,
            &metadata.secret_fields(),
        )?;

        let now = Utc::now().fixed_offset();
        let model = ActiveModel {
            id: Set(id),
            tenant_id: Set(new_connector.tenant_id),
            connector_type: Set(metadata.connector_type.clone()),
            name: Set(new_connector.name),
            config: Set(config),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        tracing::info!(
            tenant_id = %model.tenant_id,
            connector_id = %model.id,
            connector_type = %model.connector_type,
            "Connector created"
        );

        Ok(model)
    }

    /// Find a connector, ensuring it belongs to the tenant
    pub async fn find_by_tenant(
        &self,
        tenant_id: Uuid,
        connector_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(connector_id)
            .filter(Column::TenantId.eq(tenant_id))
            .one(&self.db)
            .await
    }

    pub async fn list_by_tenant(&self, tenant_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
    }

    /// The connector's config with secrets decrypted.
    pub fn decrypted_config(&self, connector: &Model) -> Result<JsonValue, CryptoError> {
        let mut config = connector.config.clone();
        decrypt_config_secrets(
            &self.crypto_key,
            SecretContext {
                tenant_id: connector.tenant_id,
                connector_type: &connector.connector_type,
                connector_id: connector.id,
            },
            &mut config,
        )
        .inspect_err(|_| {
            // Never log the error detail; it may echo ciphertext
            tracing::error!(
                tenant_id = %connector.tenant_id,
                connector_id = %connector.id,
                "Connector secret decryption failed"
            );
        })?;
        Ok(config)
    }
}
