//! Outbound rate limiting
//!
//! [`RateLimiter`] admits requests against a sliding window kept per
//! (tenant, connector type) in the ephemeral store. [`CircuitBreaker`] reacts
//! to HTTP 429 responses by pausing every request of one connector instance.

pub mod circuit_breaker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{RateLimitConfig, RateLimitSettings};
use crate::kv::KvStore;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Quota left in the current window; never negative
    pub remaining: u32,
    /// How long a denied caller should wait before retrying
    pub retry_after_ms: Option<u64>,
    /// When the oldest entry leaves the window, in epoch milliseconds
    pub reset_at_ms: Option<i64>,
    /// True when the store was unreachable and the request was let through
    pub failed_open: bool,
}

/// Window key identifying one tenant's usage of one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub tenant_id: Uuid,
    pub connector_type: String,
}

impl RateLimitKey {
    pub fn new(tenant_id: Uuid, connector_type: impl Into<String>) -> Self {
        Self {
            tenant_id,
            connector_type: connector_type.into(),
        }
    }

    fn store_key(&self) -> String {
        format!("ratelimit:{}:{}", self.tenant_id, self.connector_type)
    }
}

/// Sliding-window limiter shared by every connector instance in the process.
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn settings_for(&self, connector_type: &str) -> RateLimitSettings {
        self.config.settings_for(connector_type)
    }

    /// Reserve `n` requests in the window for `key`, using the current wall clock.
    pub async fn check_and_reserve(&self, key: &RateLimitKey, n: u32) -> RateLimitDecision {
        self.check_and_reserve_at(key, n, Utc::now().timestamp_millis())
            .await
    }

    /// Reserve `n` requests as of `now_ms` (epoch milliseconds).
    pub async fn check_and_reserve_at(
        &self,
        key: &RateLimitKey,
        n: u32,
        now_ms: i64,
    ) -> RateLimitDecision {
        let settings = self.settings_for(&key.connector_type);
        let limit = settings.requests_per_minute;
        let window_start = now_ms - settings.window_ms as i64;
        let ttl = Duration::from_millis(settings.window_ms.saturating_mul(2));

        match self
            .store
            .window_reserve(&key.store_key(), window_start, now_ms, limit, n, ttl)
            .await
        {
            Ok(reservation) if reservation.allowed => RateLimitDecision {
                allowed: true,
                remaining: limit.saturating_sub(reservation.count + n),
                retry_after_ms: None,
                reset_at_ms: reservation
                    .oldest_ms
                    .map(|oldest| oldest + settings.window_ms as i64),
                failed_open: false,
            },
            Ok(reservation) => {
                counter!(
                    "rate_limit_denied_total",
                    "connector_type" => key.connector_type.clone()
                )
                .increment(1);
                debug!(
                    tenant_id = %key.tenant_id,
                    connector_type = %key.connector_type,
                    count = reservation.count,
                    limit,
                    "Rate limit window full"
                );
                RateLimitDecision {
                    allowed: false,
                    remaining: limit.saturating_sub(reservation.count),
                    retry_after_ms: Some(settings.retry_after_ms),
                    reset_at_ms: reservation
                        .oldest_ms
                        .map(|oldest| oldest + settings.window_ms as i64),
                    failed_open: false,
                }
            }
            Err(err) => {
                warn!(
                    tenant_id = %key.tenant_id,
                    connector_type = %key.connector_type,
                    error = %err,
                    "Rate limit store unavailable; allowing request"
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: limit.saturating_sub(n),
                    retry_after_ms: None,
                    reset_at_ms: None,
                    failed_open: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitOverride;
    use crate::kv::{MemoryKvStore, StoreError, WindowReservation};
    use async_trait::async_trait;

    fn limiter(requests_per_minute: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryKvStore::new(64)),
            RateLimitConfig {
                requests_per_minute,
                retry_after_ms: 60_000,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn n_plus_one_request_is_denied() {
        let limiter = limiter(5);
        let key = RateLimitKey::new(Uuid::new_v4(), "freshservice");
        let now = 1_700_000_000_000;

        for i in 0..5 {
            let decision = limiter.check_and_reserve_at(&key, 1, now + i).await;
            assert!(decision.allowed, "request {i} should be admitted");
            assert_eq!(decision.remaining, 4 - i as u32);
        }

        let denied = limiter.check_and_reserve_at(&key, 1, now + 10).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_ms, Some(60_000));
        assert_eq!(denied.reset_at_ms, Some(now + 60_000));
    }

    #[tokio::test]
    async fn window_slides_forward() {
        let limiter = limiter(2);
        let key = RateLimitKey::new(Uuid::new_v4(), "servicenow");
        let now = 1_700_000_000_000;

        assert!(limiter.check_and_reserve_at(&key, 2, now).await.allowed);
        assert!(!limiter.check_and_reserve_at(&key, 1, now + 59_999).await.allowed);
        assert!(limiter.check_and_reserve_at(&key, 1, now + 60_001).await.allowed);
    }

    #[tokio::test]
    async fn multi_slot_reservation_respects_limit() {
        let limiter = limiter(10);
        let key = RateLimitKey::new(Uuid::new_v4(), "freshservice");
        let now = 1_700_000_000_000;

        let first = limiter.check_and_reserve_at(&key, 8, now).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);

        let second = limiter.check_and_reserve_at(&key, 3, now + 1).await;
        assert!(!second.allowed);
        assert_eq!(second.remaining, 2);
    }

    #[tokio::test]
    async fn tenants_and_connector_types_have_separate_windows() {
        let limiter = limiter(1);
        let tenant = Uuid::new_v4();
        let now = 1_700_000_000_000;

        let fresh = RateLimitKey::new(tenant, "freshservice");
        let snow = RateLimitKey::new(tenant, "servicenow");
        let other_tenant = RateLimitKey::new(Uuid::new_v4(), "freshservice");

        assert!(limiter.check_and_reserve_at(&fresh, 1, now).await.allowed);
        assert!(limiter.check_and_reserve_at(&snow, 1, now).await.allowed);
        assert!(limiter.check_and_reserve_at(&other_tenant, 1, now).await.allowed);
        assert!(!limiter.check_and_reserve_at(&fresh, 1, now).await.allowed);
    }

    #[tokio::test]
    async fn connector_override_changes_limit_and_retry_after() {
        let mut config = RateLimitConfig {
            requests_per_minute: 100,
            ..Default::default()
        };
        config.connector_overrides.insert(
            "freshservice".to_string(),
            RateLimitOverride {
                requests_per_minute: Some(1),
                burst_size: None,
                retry_after_ms: Some(5_000),
            },
        );
        let limiter = RateLimiter::new(Arc::new(MemoryKvStore::new(8)), config);
        let key = RateLimitKey::new(Uuid::new_v4(), "freshservice");

        assert!(limiter.check_and_reserve_at(&key, 1, 0).await.allowed);
        let denied = limiter.check_and_reserve_at(&key, 1, 1).await;
        assert_eq!(denied.retry_after_ms, Some(5_000));
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_with_ttl(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn window_reserve(
            &self,
            _: &str,
            _: i64,
            _: i64,
            _: u32,
            _: u32,
            _: Duration,
        ) -> Result<WindowReservation, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), RateLimitConfig::default());
        let key = RateLimitKey::new(Uuid::new_v4(), "freshservice");

        for _ in 0..500 {
            let decision = limiter.check_and_reserve(&key, 1).await;
            assert!(decision.allowed);
            assert!(decision.failed_open);
        }
    }
}
