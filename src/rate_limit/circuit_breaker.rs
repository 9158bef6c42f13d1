//! Circuit breaker for HTTP 429 responses
//!
//! A 429 from the platform pauses every request issued through the same
//! breaker, not only the failing one, because requests already in flight
//! would trip the same limit again. The failing request is then retried
//! unchanged. When one logical request sees `max_consecutive_429` responses in
//! a row the breaker gives up with [`CircuitBreakerError::Open`].
//!
//! Each connector instance owns one breaker, and the orchestrator builds a
//! fresh connector per job, so a pause never stalls a different job.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The request saw too many consecutive 429 responses
    #[error("circuit breaker open after {attempts} consecutive 429 responses")]
    Open { attempts: u32, last_retry_after: Duration },
    /// Any other failure from the wrapped operation
    #[error(transparent)]
    Inner(E),
}

/// Classification the breaker needs from an operation's error type.
pub trait RateLimitSignal {
    /// `Some(retry_after)` when the error is an HTTP 429. The inner option is
    /// the platform supplied delay, if any.
    fn rate_limited(&self) -> Option<Option<Duration>>;
}

/// Breaker shared by all requests of one connector instance.
#[derive(Debug)]
pub struct CircuitBreaker {
    connector_type: String,
    max_consecutive_429: u32,
    default_retry_after: Duration,
    paused_until: Mutex<Option<Instant>>,
    trips: AtomicU64,
    wake: Option<CancellationToken>,
}

impl CircuitBreaker {
    pub fn new(
        connector_type: impl Into<String>,
        max_consecutive_429: u32,
        default_retry_after: Duration,
    ) -> Self {
        Self {
            connector_type: connector_type.into(),
            max_consecutive_429: max_consecutive_429.max(1),
            default_retry_after,
            paused_until: Mutex::new(None),
            trips: AtomicU64::new(0),
            wake: None,
        }
    }

    /// Cut pauses short once `token` fires. The call then goes through its
    /// `after_pause` check before any retry.
    pub fn with_wake(mut self, token: CancellationToken) -> Self {
        self.wake = Some(token);
        self
    }

    /// Number of 429 responses recorded so far.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Instant until which requests are held back, if a pause is active.
    pub fn paused_until(&self) -> Option<Instant> {
        let guard = self.paused_until.lock().ok()?;
        guard.filter(|until| *until > Instant::now())
    }

    /// Sleep until any active pause has elapsed or the wake token fires.
    pub async fn wait_if_paused(&self) {
        while let Some(until) = self.paused_until() {
            match &self.wake {
                Some(wake) => tokio::select! {
                    _ = sleep_until(until) => {}
                    _ = wake.cancelled() => return,
                },
                None => sleep_until(until).await,
            }
        }
    }

    /// Extend the shared pause so it lasts at least `duration` from now.
    fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        if let Ok(mut guard) = self.paused_until.lock() {
            match *guard {
                Some(existing) if existing >= until => {}
                _ => *guard = Some(until),
            }
        }
    }

    /// Run `operation`, pausing and retrying it on 429 responses.
    ///
    /// `after_pause` runs after every pause and before the retry; an error from
    /// it aborts the call (used for cancellation checks).
    pub async fn call<T, E, F, Fut, P, PFut>(
        &self,
        mut operation: F,
        mut after_pause: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        E: RateLimitSignal,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<(), E>>,
    {
        let mut consecutive = 0u32;

        loop {
            if self.paused_until().is_some() {
                self.wait_if_paused().await;
                after_pause().await.map_err(CircuitBreakerError::Inner)?;
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(platform_delay) = error.rate_limited() else {
                return Err(CircuitBreakerError::Inner(error));
            };

            consecutive += 1;
            self.trips.fetch_add(1, Ordering::Relaxed);
            let delay = platform_delay.unwrap_or(self.default_retry_after);

            if consecutive >= self.max_consecutive_429 {
                counter!(
                    "circuit_breaker_trips_total",
                    "connector_type" => self.connector_type.clone()
                )
                .increment(1);
                warn!(
                    connector_type = %self.connector_type,
                    attempts = consecutive,
                    "Circuit breaker open: retry budget for 429 responses exhausted"
                );
                return Err(CircuitBreakerError::Open {
                    attempts: consecutive,
                    last_retry_after: delay,
                });
            }

            info!(
                connector_type = %self.connector_type,
                attempt = consecutive,
                pause_ms = delay.as_millis() as u64,
                "Received 429; pausing all requests for this connector"
            );
            self.pause_for(delay);
        }
    }
}
