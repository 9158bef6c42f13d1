//! # Server Configuration
//!
//! Router, shared state and OpenAPI document for the bridge API.

use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::connectors::Registry;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::jobs::JobService;
use crate::progress::BroadcastEmitter;
use crate::rate_limit::RateLimiter;
use crate::telemetry::trace_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub crypto_key: CryptoKey,
    pub registry: Arc<Registry>,
    pub limiter: Arc<RateLimiter>,
    pub jobs: Arc<JobService>,
    /// Source of `/jobs/{id}/events` streams
    pub events: Arc<BroadcastEmitter>,
    pub http: reqwest::Client,
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.config)
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/jobs",
            post(handlers::jobs::submit_job).get(handlers::jobs::list_jobs),
        )
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route("/jobs/{id}/cancel", post(handlers::jobs::cancel_job))
        .route("/jobs/{id}/batches", get(handlers::jobs::list_batches))
        .route("/jobs/{id}/events", get(handlers::jobs::job_events))
        .route(
            "/connectors",
            post(handlers::connectors::create_connector).get(handlers::connectors::list_connectors),
        )
        .route(
            "/connectors/{id}/test",
            post(handlers::connectors::test_connector),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::health))
        .route(
            "/connector-types",
            get(handlers::connectors::list_connector_types),
        )
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` fires.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {e}"))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::jobs::submit_job,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::cancel_job,
        crate::handlers::jobs::list_batches,
        crate::handlers::jobs::job_events,
        crate::handlers::connectors::list_connector_types,
        crate::handlers::connectors::create_connector,
        crate::handlers::connectors::list_connectors,
        crate::handlers::connectors::test_connector,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::jobs::SubmitJobRequest,
            crate::handlers::jobs::JobResponse,
            crate::handlers::jobs::JobsResponse,
            crate::handlers::jobs::BatchResponse,
            crate::handlers::jobs::BatchesResponse,
            crate::handlers::jobs::LoadResultResponse,
            crate::handlers::connectors::ConnectorTypesResponse,
            crate::handlers::connectors::CreateConnectorRequest,
            crate::handlers::connectors::ConnectorResponse,
            crate::handlers::connectors::ConnectorsResponse,
            crate::handlers::connectors::ConnectionTestResponse,
            crate::models::JobKind,
            crate::models::JobStatus,
            crate::models::JobConfig,
            crate::models::JobProgress,
            crate::models::JobPhase,
            crate::progress::ProgressEvent,
            crate::progress::ProgressData,
            crate::progress::ProgressEventType,
            crate::connectors::ConnectorMetadata,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service information"),
        (name = "jobs", description = "Extraction, loading and migration jobs"),
        (name = "connectors", description = "Connector types and configured connectors")
    ),
    info(
        title = "ITSM Bridge API",
        description = "Moves ITSM records between platforms through queued extraction, loading and migration jobs",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
