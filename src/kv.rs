//! Ephemeral key-value store
//!
//! Holds the state shared between concurrent jobs: sliding rate-limit windows
//! and short-lived cancellation flags. Every entry carries a TTL. Callers
//! treat the store as optional infrastructure: the rate limiter fails open and
//! the cancellation oracle falls back to the job record when it errors.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

/// Errors surfaced by an ephemeral store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("ephemeral store unavailable: {0}")]
    Unavailable(String),
    #[error("key '{key}' holds a value of a different kind")]
    WrongKind { key: String },
}

/// Result of an atomic sliding-window reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReservation {
    /// Whether the `n` requested slots were recorded
    pub allowed: bool,
    /// Entries inside the window before this reservation
    pub count: u32,
    /// Oldest timestamp still inside the window, in epoch milliseconds
    pub oldest_ms: Option<i64>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop window entries older than `window_start_ms`, then record `n` entries
    /// at `now_ms` if the remaining count plus `n` fits within `limit`.
    /// Pruning, counting and recording happen atomically.
    async fn window_reserve(
        &self,
        key: &str,
        window_start_ms: i64,
        now_ms: i64,
        limit: u32,
        n: u32,
        ttl: Duration,
    ) -> Result<WindowReservation, StoreError>;
}

#[derive(Debug)]
enum Value {
    Text(String),
    Window(VecDeque<i64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-process store backed by a bounded LRU with lazy per-entry expiry.
pub struct MemoryKvStore {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Remove `key` if it has expired; returns the live entry otherwise.
fn live_entry<'a>(cache: &'a mut LruCache<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = cache
        .peek(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now());
    if expired {
        cache.pop(key);
        return None;
    }
    cache.get_mut(key)
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut cache = self.lock()?;
        match live_entry(&mut cache, key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongKind {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut cache = self.lock()?;
        cache.put(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut cache = self.lock()?;
        cache.pop(key);
        Ok(())
    }

    async fn window_reserve(
        &self,
        key: &str,
        window_start_ms: i64,
        now_ms: i64,
        limit: u32,
        n: u32,
        ttl: Duration,
    ) -> Result<WindowReservation, StoreError> {
        let mut cache = self.lock()?;

        if live_entry(&mut cache, key).is_none() {
            cache.put(
                key.to_string(),
                Entry {
                    value: Value::Window(VecDeque::new()),
                    expires_at: Instant::now() + ttl,
                },
            );
        }

        let Some(entry) = cache.get_mut(key) else {
            return Err(StoreError::Unavailable(format!(
                "window '{key}' evicted during reservation"
            )));
        };

        let Value::Window(timestamps) = &mut entry.value else {
            return Err(StoreError::WrongKind {
                key: key.to_string(),
            });
        };

        while timestamps.front().is_some_and(|ts| *ts < window_start_ms) {
            timestamps.pop_front();
        }

        let count = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        let allowed = count.saturating_add(n) <= limit;
        if allowed {
            timestamps.extend(std::iter::repeat_n(now_ms, n as usize));
            entry.expires_at = Instant::now() + ttl;
        }

        Ok(WindowReservation {
            allowed,
            count,
            oldest_ms: timestamps.front().copied(),
        })
    }
}
