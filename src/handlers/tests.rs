//! # Tests for Handlers
//!
//! Drive the full router against in-memory SQLite.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::test_db;
use crate::models::ServiceInfo;
use crate::server::create_app;
use crate::services::Services;

const TOKEN: &str = "operator-token";

async fn app() -> Router {
    let config = AppConfig {
        operator_tokens: vec![TOKEN.to_string()],
        crypto_key: Some(vec![3u8; 32]),
        ..Default::default()
    };
    let services = Services::new(config, test_db().await).expect("wire services");
    create_app(services.state)
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    tenant: Uuid,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {TOKEN}"))
        .header("X-Tenant-Id", tenant.to_string());
    let body = match body {
        Some(value) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn create_freshservice(app: &Router, tenant: Uuid) -> Uuid {
    let (status, body) = call(
        app,
        "POST",
        "/connectors",
        tenant,
        Some(json!({
            "connectorType": "freshservice",
            "name": "Helpdesk",
            "config": {"domain": "acme", "apiKey": "very-secret"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn root_returns_service_info() {
    let response = app()
        .await
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let info: ServiceInfo = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(info.service, "itsm-bridge");
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn health_reports_database_up() {
    let response = app()
        .await
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn connector_types_list_both_platforms() {
    let response = app()
        .await
        .oneshot(
            Request::builder()
                .uri("/connector-types")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    let types: Vec<&str> = body["connectorTypes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|meta| meta["connectorType"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["freshservice", "servicenow"]);
}

#[tokio::test]
async fn jobs_require_operator_token() {
    let response = app()
        .await
        .oneshot(
            Request::builder()
                .uri("/jobs")
                .header("X-Tenant-Id", Uuid::new_v4().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn connector_secrets_are_masked() {
    let app = app().await;
    let tenant = Uuid::new_v4();
    create_freshservice(&app, tenant).await;

    let (status, body) = call(&app, "GET", "/connectors", tenant, None).await;
    assert_eq!(status, StatusCode::OK);
    let config = &body["connectors"][0]["config"];
    assert_eq!(config["domain"], "acme");
    assert_eq!(config["apiKey"], "********");

    // Other tenants see nothing
    let (_, body) = call(&app, "GET", "/connectors", Uuid::new_v4(), None).await;
    assert!(body["connectors"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn connector_missing_required_field_is_rejected() {
    let app = app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/connectors",
        Uuid::new_v4(),
        Some(json!({"connectorType": "freshservice", "name": "x", "config": {"domain": "acme"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["details"]["config"], json!(["apiKey"]));
}

#[tokio::test]
async fn submit_get_and_cancel_job() {
    let app = app().await;
    let tenant = Uuid::new_v4();
    let source = create_freshservice(&app, tenant).await;

    let (status, created) = call(
        &app,
        "POST",
        "/jobs",
        tenant,
        Some(json!({
            "jobType": "EXTRACTION",
            "sourceConnectorId": source,
            "entities": ["tickets"],
            "config": {"batchSize": 50}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["status"], "QUEUED");
    assert_eq!(created["config"]["batchSize"], 50);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = call(&app, "GET", &format!("/jobs/{id}"), tenant, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["entities"], json!(["tickets"]));

    let (status, listed) = call(&app, "GET", "/jobs?status=QUEUED", tenant, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);

    let (status, cancelled) = call(&app, "POST", &format!("/jobs/{id}/cancel"), tenant, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "CANCELLED");
    assert_eq!(cancelled["errorCode"], "CANCELLED");

    let (status, _) = call(&app, "POST", &format!("/jobs/{id}/cancel"), tenant, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Jobs are tenant scoped
    let (status, _) = call(&app, "GET", &format!("/jobs/{id}"), Uuid::new_v4(), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_job_is_rejected_before_enqueue() {
    let app = app().await;
    let tenant = Uuid::new_v4();
    let source = create_freshservice(&app, tenant).await;

    let (status, body) = call(
        &app,
        "POST",
        "/jobs",
        tenant,
        Some(json!({
            "jobType": "MIGRATION",
            "sourceConnectorId": source,
            "entities": ["tickets"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (_, listed) = call(&app, "GET", "/jobs", tenant, None).await;
    assert!(listed["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn list_jobs_rejects_bad_filters() {
    let app = app().await;
    let tenant = Uuid::new_v4();

    let (status, _) = call(&app, "GET", "/jobs?limit=0", tenant, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, "GET", "/jobs?status=running", tenant, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batches_of_unknown_job_are_not_found() {
    let app = app().await;
    let (status, body) = call(
        &app,
        "GET",
        &format!("/jobs/{}/batches", Uuid::new_v4()),
        Uuid::new_v4(),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn events_of_finished_job_end_after_snapshot() {
    let app = app().await;
    let tenant = Uuid::new_v4();
    let source = create_freshservice(&app, tenant).await;
    let (_, created) = call(
        &app,
        "POST",
        "/jobs",
        tenant,
        Some(json!({
            "jobType": "EXTRACTION",
            "sourceConnectorId": source,
            "entities": ["tickets"]
        })),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();
    call(&app, "POST", &format!("/jobs/{id}/cancel"), tenant, None).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{id}/events"))
                .header("Authorization", format!("Bearer {TOKEN}"))
                .header("X-Tenant-Id", tenant.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: status"));
    assert!(text.contains("\"status\":\"CANCELLED\""));
}

#[tokio::test]
async fn openapi_document_lists_job_routes() {
    use utoipa::OpenApi;

    let doc = crate::server::ApiDoc::openapi();
    let json = serde_json::to_value(&doc).unwrap();
    for path in ["/jobs", "/jobs/{id}/cancel", "/jobs/{id}/events", "/connector-types"] {
        assert!(json["paths"].get(path).is_some(), "missing {path}");
    }
    assert!(json["components"]["securitySchemes"].get("bearer_auth").is_some());
}
