//! Freshservice connector against a mock API, end to end through the worker.

mod test_utils;

use std::collections::HashMap;
use std::sync::Arc;

use itsm_bridge::config::RateLimitConfig;
use itsm_bridge::connectors::detail::{SOURCE_DETAIL, SOURCE_LIST_FALLBACK, extraction_source};
use itsm_bridge::connectors::{
    Connector, ConnectorContext, ConnectorError, FreshserviceConnector,
};
use itsm_bridge::jobs::JobSubmission;
use itsm_bridge::kv::MemoryKvStore;
use itsm_bridge::models::{JobConfig, JobKind, JobStatus};
use itsm_bridge::rate_limit::RateLimiter;
use itsm_bridge::repositories::{ExtractedBatchRepository, JobRepository};
use itsm_bridge::services::Services;
use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use test_utils::{create_connector, services};

/// Page-numbered ticket listing over `total` tickets.
struct TicketPages {
    total: u64,
}

impl Respond for TicketPages {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let page: u64 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        let per_page: u64 = query.get("per_page").and_then(|p| p.parse().ok()).unwrap_or(30);

        let start = (page - 1) * per_page;
        let end = (start + per_page).min(self.total);
        let tickets: Vec<Value> = (start..end)
            .map(|index| {
                json!({
                    "id": index + 1,
                    "subject": format!("Ticket {}", index + 1),
                    "status": 2,
                    "updated_at": "2026-01-15T10:00:00Z"
                })
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "tickets": tickets }))
    }
}

/// Single-ticket endpoint echoing the id from the path.
struct TicketDetail;

impl Respond for TicketDetail {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let id: u64 = request
            .url
            .path()
            .rsplit('/')
            .next()
            .and_then(|segment| segment.parse().ok())
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({
            "ticket": {
                "id": id,
                "description_text": format!("Full description of ticket {id}")
            }
        }))
    }
}

async fn freshservice_source(services: &Services, tenant: Uuid, server: &MockServer) -> Uuid {
    create_connector(
        services,
        tenant,
        "freshservice",
        json!({"domain": "acme", "apiKey": "fs-key", "baseUrl": server.uri()}),
    )
    .await
    .unwrap()
    .id
}

async fn run_extraction(
    services: &Services,
    tenant: Uuid,
    source: Uuid,
    config: JobConfig,
) -> Uuid {
    let job = services
        .state
        .jobs
        .submit(JobSubmission {
            tenant_id: tenant,
            kind: JobKind::Extraction,
            source_connector_id: source,
            destination_connector_id: None,
            entities: vec!["tickets".to_string()],
            config,
        })
        .await
        .unwrap();
    services.worker.drain().await.unwrap();
    job.id
}

fn connector(server: &MockServer) -> FreshserviceConnector {
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryKvStore::new(64)),
        RateLimitConfig::default(),
    ));
    FreshserviceConnector::new(ConnectorContext {
        tenant_id: Uuid::new_v4(),
        connector_id: Uuid::new_v4(),
        config: json!({"domain": "acme", "apiKey": "fs-key", "baseUrl": server.uri()}),
        limiter,
        cancellation: None,
        http: reqwest::Client::new(),
    })
    .unwrap()
}

#[tokio::test]
async fn extraction_pages_until_a_short_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets"))
        .respond_with(TicketPages { total: 250 })
        .mount(&server)
        .await;

    let services = services().await.unwrap();
    let tenant = Uuid::new_v4();
    let source = freshservice_source(&services, tenant, &server).await;
    let job_id = run_extraction(
        &services,
        tenant,
        source,
        JobConfig {
            batch_size: Some(100),
            include_details: Some(false),
            ..Default::default()
        },
    )
    .await;

    let job = JobRepository::new(services.state.db.clone())
        .find_by_id(job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status().unwrap(), JobStatus::DataReady, "{:?}", job.error_message);

    let requests = server.received_requests().await.unwrap();
    let pages: Vec<(String, String)> = requests
        .iter()
        .map(|request| {
            let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
            (query["page"].clone(), query["per_page"].clone())
        })
        .collect();
    assert_eq!(
        pages,
        vec![
            ("1".to_string(), "100".to_string()),
            ("2".to_string(), "100".to_string()),
            ("3".to_string(), "100".to_string()),
        ]
    );

    let batches = ExtractedBatchRepository::new(services.state.db.clone(), 7)
        .list_by_job(job_id)
        .await
        .unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].record_count, 250);
    assert_eq!(batches[0].source_system, "freshservice");

    let transformed = batches[0].transformed_records.as_ref().unwrap();
    assert_eq!(transformed.as_array().unwrap().len(), 250);
}

#[tokio::test]
async fn failed_detail_keeps_list_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets"))
        .respond_with(TicketPages { total: 10 })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets/7"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/v2/tickets/\d+$"))
        .respond_with(TicketDetail)
        .mount(&server)
        .await;

    let services = services().await.unwrap();
    let tenant = Uuid::new_v4();
    let source = freshservice_source(&services, tenant, &server).await;
    let job_id = run_extraction(
        &services,
        tenant,
        source,
        JobConfig {
            batch_size: Some(100),
            detail_batch_size: Some(10),
            ..Default::default()
        },
    )
    .await;

    let job = JobRepository::new(services.state.db.clone())
        .find_by_id(job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status().unwrap(), JobStatus::DataReady);

    let batches = ExtractedBatchRepository::new(services.state.db.clone(), 7)
        .list_by_job(job_id)
        .await
        .unwrap();
    let records = batches[0].raw();
    assert_eq!(records.len(), 10);

    let detailed = records
        .iter()
        .filter(|record| extraction_source(record) == Some(SOURCE_DETAIL))
        .count();
    let fallback: Vec<&Value> = records
        .iter()
        .filter(|record| extraction_source(record) == Some(SOURCE_LIST_FALLBACK))
        .collect();
    assert_eq!(detailed, 9);
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0]["id"], 7);
    assert_eq!(fallback[0]["subject"], "Ticket 7");

    let enriched = records.iter().find(|record| record["id"] == 1).unwrap();
    assert_eq!(enriched["description_text"], "Full description of ticket 1");
    assert_eq!(enriched["subject"], "Ticket 1");
}

#[tokio::test]
async fn rejected_api_key_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    let error = connector(&server).test_connection().await.unwrap_err();
    assert!(matches!(error, ConnectorError::Authentication { .. }), "{error:?}");
}

#[tokio::test]
async fn rate_limited_requests_are_retried_after_the_pause() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets"))
        .respond_with(TicketPages { total: 1 })
        .mount(&server)
        .await;

    connector(&server).test_connection().await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn persistent_429_opens_the_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .mount(&server)
        .await;

    let error = connector(&server).test_connection().await.unwrap_err();
    assert!(matches!(error, ConnectorError::CircuitBreakerOpen { attempts: 3 }), "{error:?}");
}

#[tokio::test]
async fn load_reports_field_errors_per_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/tickets"))
        .and(wiremock::matchers::body_partial_json(json!({"subject": "Broken"})))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "description": "Validation failed",
            "errors": [{
                "field": "priority",
                "message": "It should be one of these values: '1,2,3,4'"
            }]
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/tickets"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ticket": {"id": 99}})))
        .mount(&server)
        .await;

    let records = vec![
        json!({"subject": "Works", "description": "ok", "email": "a@example.com"}),
        json!({"subject": "Broken", "description": "bad", "email": "b@example.com", "priority": 9}),
        json!({"subject": "Also works", "description": "ok", "email": "c@example.com"}),
    ];
    let outcome = connector(&server).load_batch("tickets", &records).await.unwrap();

    assert_eq!(outcome.success_count, 2);
    assert_eq!(outcome.failure_count(), 1);
    let error = &outcome.errors[0];
    assert_eq!(error.index, 1);
    assert_eq!(error.message, "Validation failed");
    assert_eq!(error.field_errors[0].field, "priority");
}

#[tokio::test]
async fn tickets_without_requester_fail_validation() {
    let server = MockServer::start().await;
    let records = vec![
        json!({"subject": "Has requester", "description": "x", "requester_id": 5}),
        json!({"subject": "No requester", "description": "x"}),
        json!({"description": "No subject", "email": "a@example.com"}),
    ];

    let errors = connector(&server).validate_for_load("tickets", &records);
    let indexes: Vec<usize> = errors.iter().map(|error| error.index).collect();
    assert_eq!(indexes, vec![1, 2]);
    assert_eq!(errors[0].field_errors[0].field, "email");
    assert_eq!(errors[1].field_errors[0].field, "subject");
}
