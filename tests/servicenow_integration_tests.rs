//! ServiceNow connector against a mock instance.

use std::collections::HashMap;
use std::sync::Arc;

use itsm_bridge::config::RateLimitConfig;
use itsm_bridge::connectors::{
    Connector, ConnectorContext, ConnectorError, ExtractOptions, ServiceNowConnector, Unattended,
};
use itsm_bridge::kv::MemoryKvStore;
use itsm_bridge::rate_limit::RateLimiter;
use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Offset-paginated incident table with `total` rows.
struct IncidentTable {
    total: u64,
}

impl Respond for IncidentTable {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let offset: u64 = query
            .get("sysparm_offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let limit: u64 = query
            .get("sysparm_limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let end = (offset + limit).min(self.total);
        let result: Vec<Value> = (offset..end)
            .map(|n| {
                json!({
                    "sys_id": format!("inc{n:04}"),
                    "short_description": format!("Incident {n}"),
                    "state": "1"
                })
            })
            .collect();
        ResponseTemplate::new(200)
            .insert_header("X-Total-Count", self.total.to_string().as_str())
            .set_body_json(json!({ "result": result }))
    }
}

fn connector(server: &MockServer) -> ServiceNowConnector {
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryKvStore::new(64)),
        RateLimitConfig::default(),
    ));
    ServiceNowConnector::new(ConnectorContext {
        tenant_id: Uuid::new_v4(),
        connector_id: Uuid::new_v4(),
        config: json!({
            "instanceUrl": server.uri(),
            "clientId": "client",
            "clientSecret": "secret",
            "username": "integration",
            "password": "hunter2"
        }),
        limiter,
        cancellation: None,
        http: reqwest::Client::new(),
    })
    .unwrap()
}

async fn mount_token(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/oauth_token.do"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": token, "expires_in": 1800})),
        )
        .mount(server)
        .await;
}

fn token_requests(requests: &[Request]) -> usize {
    requests
        .iter()
        .filter(|request| request.url.path() == "/oauth_token.do")
        .count()
}

#[tokio::test]
async fn extraction_walks_offsets_with_one_token() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1").await;
    Mock::given(method("GET"))
        .and(path("/api/now/table/incident"))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(IncidentTable { total: 5 })
        .mount(&server)
        .await;

    let options = ExtractOptions {
        batch_size: 2,
        include_details: false,
        ..Default::default()
    };
    let records = connector(&server)
        .extract_with_progress("incidents", &options, &Unattended)
        .await
        .unwrap();

    assert_eq!(records.len(), 5);
    assert_eq!(records[0]["sys_id"], "inc0000");
    assert_eq!(records[4]["sys_id"], "inc0004");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(token_requests(&requests), 1);
    let offsets: Vec<String> = requests
        .iter()
        .filter(|request| request.url.path() == "/api/now/table/incident")
        .map(|request| {
            let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
            query["sysparm_offset"].clone()
        })
        .collect();
    assert_eq!(offsets, vec!["0", "2", "4"]);
}

#[tokio::test]
async fn expired_token_is_refreshed_once() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1").await;
    Mock::given(method("GET"))
        .and(path("/api/now/table/sys_user"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/now/table/sys_user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": []})))
        .mount(&server)
        .await;

    connector(&server).test_connection().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(token_requests(&requests), 2);
}

#[tokio::test]
async fn rejected_token_request_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth_token.do"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
        )
        .mount(&server)
        .await;

    let error = connector(&server).authenticate().await.unwrap_err();
    assert!(matches!(error, ConnectorError::Authentication { .. }), "{error:?}");
}

#[tokio::test]
async fn table_api_errors_become_record_errors() {
    let server = MockServer::start().await;
    mount_token(&server, "tok-1").await;
    Mock::given(method("POST"))
        .and(path("/api/now/table/incident"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {
                "message": "Operation Failed",
                "detail": "ACL Exception Insert Failed due to security constraints"
            }
        })))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/now/table/incident"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "message": "Operation Failed",
                "detail": "Mandatory field short_description is empty"
            }
        })))
        .mount(&server)
        .await;

    // A 403 after a token refresh is fatal for the batch
    let error = connector(&server)
        .load_batch("incidents", &[json!({"short_description": "x"})])
        .await
        .unwrap_err();
    assert!(matches!(error, ConnectorError::Authentication { .. }), "{error:?}");

    let outcome = connector(&server)
        .load_batch("incidents", &[json!({"short_description": ""})])
        .await
        .unwrap();
    assert_eq!(outcome.success_count, 0);
    assert_eq!(outcome.errors[0].message, "Operation Failed");
    assert_eq!(outcome.errors[0].field_errors[0].field, "short_description");
}
