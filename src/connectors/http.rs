//! Rate-limited HTTP client for connectors
//!
//! Every outbound platform request goes through [`ApiClient::send`], which
//! reserves a slot in the tenant's sliding window, issues the request, and
//! lets the connector's [`CircuitBreaker`] pause and retry on HTTP 429.
//! Cancellation is re-checked after every rate-limit wait and breaker pause
//! so a cancelled job never issues another request after sleeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancellation::JobCancellation;
use crate::connectors::trait_::ConnectorError;
use crate::rate_limit::{CircuitBreaker, RateLimitKey, RateLimiter};

/// Longest error body kept in [`ConnectorError::Http`]
const MAX_ERROR_BODY: usize = 2048;

pub struct ApiClient {
    http: Client,
    key: RateLimitKey,
    limiter: Arc<RateLimiter>,
    breaker: CircuitBreaker,
    cancellation: Option<JobCancellation>,
}

impl ApiClient {
    pub fn new(
        http: Client,
        tenant_id: Uuid,
        connector_type: &str,
        limiter: Arc<RateLimiter>,
        cancellation: Option<JobCancellation>,
    ) -> Self {
        let settings = limiter.settings_for(connector_type);
        let mut breaker = CircuitBreaker::new(
            connector_type,
            settings.max_consecutive_429,
            Duration::from_millis(settings.retry_after_ms),
        );
        if let Some(cancellation) = &cancellation {
            breaker = breaker.with_wake(cancellation.marker().clone());
        }
        Self {
            http,
            key: RateLimitKey::new(tenant_id, connector_type),
            breaker,
            limiter,
            cancellation,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Send the request produced by `build`, returning the successful response.
    ///
    /// `build` runs again for every retry, so it must describe the identical
    /// request each time.
    pub async fn send<F>(&self, build: F) -> Result<Response, ConnectorError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let build = &build;
        self.breaker
            .call(|| self.attempt(build), || self.ensure_not_cancelled())
            .await
            .map_err(ConnectorError::from)
    }

    /// [`send`](Self::send) and decode the body as JSON.
    pub async fn send_json<F>(&self, build: F) -> Result<JsonValue, ConnectorError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self.send(build).await?;
        response
            .json()
            .await
            .map_err(|e| ConnectorError::malformed(e.to_string()))
    }

    /// Fails with [`ConnectorError::Cancelled`] once the job has been cancelled.
    pub async fn ensure_not_cancelled(&self) -> Result<(), ConnectorError> {
        if let Some(cancellation) = &self.cancellation
            && cancellation.is_cancelled().await
        {
            return Err(ConnectorError::Cancelled);
        }
        Ok(())
    }

    async fn attempt<F>(&self, build: &F) -> Result<Response, ConnectorError>
    where
        F: Fn(&Client) -> RequestBuilder + Sync,
    {
        self.admit().await?;
        let response = build(&self.http).send().await?;
        check_status(response).await
    }

    /// Wait until the sliding window admits one more request.
    async fn admit(&self) -> Result<(), ConnectorError> {
        loop {
            let decision = self.limiter.check_and_reserve(&self.key, 1).await;
            if decision.allowed {
                return Ok(());
            }

            let wait = Duration::from_millis(decision.retry_after_ms.unwrap_or(1_000));
            info!(
                tenant_id = %self.key.tenant_id,
                connector_type = %self.key.connector_type,
                wait_ms = wait.as_millis() as u64,
                "Rate limit window full; waiting"
            );
            self.pause(wait).await;
            self.ensure_not_cancelled().await?;
        }
    }

    async fn pause(&self, duration: Duration) {
        match &self.cancellation {
            Some(cancellation) => cancellation.sleep(duration).await,
            None => tokio::time::sleep(duration).await,
        }
    }
}

/// Map a non-success response to a [`ConnectorError`].
pub async fn check_status(response: Response) -> Result<Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status.as_u16() == 429 {
        let retry_after = parse_retry_after(response.headers());
        debug!(retry_after = ?retry_after, "Platform returned 429");
        return Err(ConnectorError::RateLimited { retry_after });
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }

    match status.as_u16() {
        401 | 403 => Err(ConnectorError::Authentication {
            details: format!("HTTP {}: {}", status.as_u16(), body),
        }),
        code => Err(ConnectorError::Http { status: code, body }),
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = at.signed_duration_since(Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::kv::MemoryKvStore;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(requests_per_minute: u32) -> ApiClient {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryKvStore::new(64)),
            RateLimitConfig {
                requests_per_minute,
                retry_after_ms: 50,
                ..Default::default()
            },
        ));
        ApiClient::new(Client::new(), Uuid::new_v4(), "freshservice", limiter, None)
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn maps_statuses_to_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let api = client(100);
        let uri = server.uri();

        let err = api
            .send(|http| http.get(format!("{uri}/auth")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Authentication { .. }));

        let err = api
            .send(|http| http.get(format!("{uri}/broken")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Http { status: 500, ref body } if body == "oops"));
    }

    #[tokio::test]
    async fn retries_after_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tickets"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tickets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let api = client(100);
        let uri = server.uri();
        let body = api
            .send_json(|http| http.get(format!("{uri}/tickets")))
            .await
            .unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(api.breaker().trips(), 1);
    }

    #[tokio::test]
    async fn persistent_429_opens_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let api = client(100);
        let uri = server.uri();
        let err = api
            .send(|http| http.get(format!("{uri}/tickets")))
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::CircuitBreakerOpen { attempts: 3 }));
    }

    #[tokio::test]
    async fn full_window_waits_for_retry_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let api = client(1);
        let uri = server.uri();
        api.send(|http| http.get(format!("{uri}/a"))).await.unwrap();

        // The second request cannot be admitted inside the window
        let second = tokio::time::timeout(
            Duration::from_millis(300),
            api.send(|http| http.get(format!("{uri}/b"))),
        )
        .await;
        assert!(second.is_err(), "request should still be waiting for the window");
    }
}
