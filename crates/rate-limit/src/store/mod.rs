//! Counter store backends.
//!
//! Every limiter in this crate keeps its state in a [`CounterStore`] so that
//! all gateway instances pointed at the same backend share one view of each
//! quota. Two backends are provided:
//!
//! - [`RedisCounterStore`] for production deployments.
//! - [`InMemoryCounterStore`] for single-process setups and tests.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quotaguard_common::{QuotaError, StoreBackend, StoreConfig};
use thiserror::Error;

pub use self::memory::InMemoryCounterStore;
pub use self::redis::RedisCounterStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid key pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("unexpected value at '{key}': {value}")]
    Corrupt { key: String, value: String },
}

impl From<StoreError> for QuotaError {
    fn from(err: StoreError) -> Self {
        QuotaError::StoreUnavailable(err.to_string())
    }
}

/// Outcome of [`CounterStore::admit_marker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerOutcome {
    /// Markers inside the window after the call, including the new one.
    pub count: u64,
    pub inserted: bool,
}

/// The narrow set of store primitives the limiters need: sorted sets scored by
/// millisecond timestamps, plain string values with a TTL, deletion and key
/// enumeration.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    /// Members with a score of at least `min_score`.
    async fn zcount(&self, key: &str, min_score: i64) -> Result<u64, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Removes members scored strictly below `max_score`.
    async fn zremrangebyscore(&self, key: &str, max_score: i64) -> Result<u64, StoreError>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Keys matching a glob-style pattern (`*`, `?`, `[...]`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Count the markers in `[now_ms - window_ms, +inf)` and, if the count is
    /// below `limit`, record `member` at `now_ms`, refresh the key TTL and
    /// prune markers older than the window.
    ///
    /// The default implementation issues the primitives one by one, so two
    /// concurrent callers may both observe `limit - 1`. Backends that can
    /// evaluate the whole step atomically override it.
    async fn admit_marker(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: u64,
        limit: u64,
        member: &str,
    ) -> Result<MarkerOutcome, StoreError> {
        let window_start = window_start(now_ms, window_ms);
        let count = self.zcount(key, window_start).await?;
        if count >= limit {
            return Ok(MarkerOutcome {
                count,
                inserted: false,
            });
        }

        self.zadd(key, now_ms, member).await?;
        self.expire(key, ttl_secs(window_ms)).await?;
        self.zremrangebyscore(key, window_start).await?;

        Ok(MarkerOutcome {
            count: count + 1,
            inserted: true,
        })
    }
}

/// Key TTL for a window: whole seconds, rounded up, never zero.
pub fn ttl_secs(window_ms: u64) -> u64 {
    window_ms.div_ceil(1000).max(1)
}

/// Oldest marker score still inside a window ending at `now_ms`.
pub fn window_start(now_ms: i64, window_ms: u64) -> i64 {
    now_ms.saturating_sub(i64::try_from(window_ms).unwrap_or(i64::MAX))
}

/// Expiry timestamp in epoch milliseconds for a TTL given in seconds.
pub fn expires_after(now_ms: i64, ttl_secs: u64) -> i64 {
    let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    now_ms.saturating_add(ttl_ms)
}

/// Build the store selected by `config`.
///
/// The Redis backend connects lazily on first use, so a store that is down
/// at startup only degrades individual checks instead of aborting.
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("using in-memory counter store");
            let store = Arc::new(InMemoryCounterStore::new());
            store.start_cleanup_task(Duration::from_secs(60));
            Ok(store)
        }
        StoreBackend::Redis => {
            tracing::info!(url = %config.url, timeout_ms = config.timeout_ms, "using redis counter store");
            let store = RedisCounterStore::new(
                &config.url,
                Duration::from_millis(config.timeout_ms),
                Duration::from_millis(config.connect_timeout_ms),
            )?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_secs(60_000), 60);
        assert_eq!(ttl_secs(1_500), 2);
        assert_eq!(ttl_secs(1), 1);
        assert_eq!(ttl_secs(0), 1);
    }

    #[test]
    fn window_arithmetic_saturates() {
        assert_eq!(window_start(10_000, 4_000), 6_000);
        assert_eq!(window_start(10_000, u64::MAX), i64::MIN);
        assert_eq!(expires_after(1_000, 2), 3_000);
        assert_eq!(expires_after(1_000, u64::MAX), i64::MAX);
    }
}
