//! # Connector API Handlers
//!
//! Connector-type discovery plus registration and testing of a tenant's
//! configured connectors. Secret config fields never leave the service.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, TenantExtension};
use crate::connectors::{ConnectorContext, ConnectorError, ConnectorMetadata};
use crate::crypto::redact_config_secrets;
use crate::error::{ApiError, not_found, validation_error};
use crate::models::connector;
use crate::repositories::{ConnectorRepository, ConnectorRepositoryError, NewConnector};
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorTypesResponse {
    pub connector_types: Vec<ConnectorMetadata>,
}

/// Connector registration payload
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectorRequest {
    #[schema(example = "freshservice")]
    pub connector_type: String,
    #[schema(example = "Helpdesk production")]
    pub name: String,
    /// Fields as described by the connector type's `configFields`
    #[schema(example = json!({"domain": "acme", "apiKey": "..."}))]
    pub config: JsonValue,
}

/// A configured connector; secret fields are masked
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorResponse {
    pub id: Uuid,
    pub connector_type: String,
    pub name: String,
    pub config: JsonValue,
    pub created_at: String,
    pub updated_at: String,
}

impl ConnectorResponse {
    fn redacted(model: connector::Model, metadata: Option<&ConnectorMetadata>) -> Self {
        let mut config = model.config;
        if let Some(metadata) = metadata {
            redact_config_secrets(&mut config, &metadata.secret_fields());
        }

        Self {
            id: model.id,
            connector_type: model.connector_type,
            name: model.name,
            config,
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectorsResponse {
    pub connectors: Vec<ConnectorResponse>,
}

/// Result of a connection test
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResponse {
    pub success: bool,
    /// Failure detail when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn repository(state: &AppState) -> ConnectorRepository {
    ConnectorRepository::new(state.db.clone(), state.crypto_key.clone())
}

/// List connector types and their configuration schemas
#[utoipa::path(
    get,
    path = "/connector-types",
    responses(
        (status = 200, description = "Registered connector types", body = ConnectorTypesResponse)
    ),
    tag = "connectors"
)]
pub async fn list_connector_types(State(state): State<AppState>) -> Json<ConnectorTypesResponse> {
    Json(ConnectorTypesResponse {
        connector_types: state.registry.list_metadata(),
    })
}

/// Register a connector for the tenant
#[utoipa::path(
    post,
    path = "/connectors",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader),
    request_body = CreateConnectorRequest,
    responses(
        (status = 201, description = "Connector created", body = ConnectorResponse),
        (status = 400, description = "Unknown type or invalid config", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "connectors"
)]
pub async fn create_connector(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Json(request): Json<CreateConnectorRequest>,
) -> Result<(StatusCode, Json<ConnectorResponse>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(validation_error(
            "Invalid connector",
            json!({ "name": "Must not be empty" }),
        ));
    }

    let metadata = state
        .registry
        .get_metadata(&request.connector_type)
        .map_err(|err| {
            validation_error(
                "Unknown connector type",
                json!({ "connectorType": err.to_string() }),
            )
        })?;

    let created = repository(&state)
        .create(
            metadata,
            NewConnector {
                tenant_id: tenant,
                name: request.name,
                config: request.config,
            },
        )
        .await
        .map_err(|err| match err {
            ConnectorRepositoryError::InvalidConfig => validation_error(
                "Invalid connector config",
                json!({ "config": "Must be a JSON object" }),
            ),
            ConnectorRepositoryError::MissingFields(fields) => validation_error(
                "Missing required config fields",
                json!({ "config": fields }),
            ),
            ConnectorRepositoryError::Database(err) => err.into(),
            ConnectorRepositoryError::Crypto(err) => ApiError::from(anyhow::Error::new(err)),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(ConnectorResponse::redacted(created, Some(metadata))),
    ))
}

/// List the tenant's connectors
#[utoipa::path(
    get,
    path = "/connectors",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader),
    responses(
        (status = 200, description = "Connectors of the tenant", body = ConnectorsResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "connectors"
)]
pub async fn list_connectors(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
) -> Result<Json<ConnectorsResponse>, ApiError> {
    let connectors = repository(&state)
        .list_by_tenant(tenant)
        .await?
        .into_iter()
        .map(|model| {
            let metadata = state.registry.get_metadata(&model.connector_type).ok();
            ConnectorResponse::redacted(model, metadata)
        })
        .collect();

    Ok(Json(ConnectorsResponse { connectors }))
}

/// Check a connector's credentials against its platform
#[utoipa::path(
    post,
    path = "/connectors/{id}/test",
    security(("bearer_auth" = [])),
    params(crate::auth::TenantHeader, ("id" = Uuid, Path, description = "Connector ID")),
    responses(
        (status = 200, description = "Test ran; see `success`", body = ConnectionTestResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Connector not found", body = ApiError)
    ),
    tag = "connectors"
)]
pub async fn test_connector(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Path(connector_id): Path<Uuid>,
) -> Result<Json<ConnectionTestResponse>, ApiError> {
    let repository = repository(&state);
    let model = repository
        .find_by_tenant(tenant, connector_id)
        .await?
        .ok_or_else(|| not_found("Connector"))?;

    let config = repository
        .decrypted_config(&model)
        .map_err(|err| ApiError::from(anyhow::Error::new(err)))?;

    let context = ConnectorContext {
        tenant_id: tenant,
        connector_id: model.id,
        config,
        limiter: state.limiter.clone(),
        cancellation: None,
        http: state.http.clone(),
    };

    let outcome = match state.registry.build(&model.connector_type, context) {
        Ok(connector) => connector.test_connection().await,
        Err(err) => Err(ConnectorError::configuration(err.to_string())),
    };

    let response = match outcome {
        Ok(()) => ConnectionTestResponse {
            success: true,
            message: None,
        },
        Err(err) => {
            tracing::info!(
                connector_id = %model.id,
                connector_type = %model.connector_type,
                error = %err,
                "Connection test failed"
            );
            ConnectionTestResponse {
                success: false,
                message: Some(err.to_string()),
            }
        }
    };

    Ok(Json(response))
}
