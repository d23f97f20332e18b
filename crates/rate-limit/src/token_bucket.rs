use std::sync::Arc;

use quotaguard_common::{BurstControlConfig, FailureMode};
use tracing::warn;

use crate::keys::{last_refill_key, tokens_key};
use crate::store::{ttl_secs, CounterStore, StoreError};
use crate::types::{now_millis, reset_at, RateLimitResult};

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    /// Epoch milliseconds.
    pub last_refill: i64,
}

impl BucketState {
    /// Tokens available at `now_ms`: the stored count plus continuous refill,
    /// capped at the bucket size.
    pub fn refilled(&self, config: &BurstControlConfig, now_ms: i64) -> f64 {
        let elapsed_secs = (now_ms - self.last_refill).max(0) as f64 / 1000.0;
        (self.tokens + elapsed_secs * config.recovery_rate).min(config.bucket_size as f64)
    }
}

/// A token bucket limiter for named operation types.
///
/// The bucket lives in two store keys, `<key>:tokens` and `<key>:last_refill`.
/// A missing bucket starts full. Every evaluation persists the refilled
/// state, and a request is admitted when at least one whole token is
/// available.
///
/// The read and the write are separate store calls, so concurrent checks on
/// one bucket may both spend the same token.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    failure_mode: FailureMode,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn CounterStore>, failure_mode: FailureMode) -> Self {
        Self {
            store,
            failure_mode,
        }
    }

    /// Try to take one token from the bucket at `key`.
    ///
    /// `limit` is the bucket size and `remaining` the whole tokens left after
    /// this request. `current` is reported as `limit - remaining`, not as the
    /// rounded-up token count, so the three fields stay consistent.
    pub async fn check(&self, key: &str, config: &BurstControlConfig) -> RateLimitResult {
        let now = now_millis();
        match self.try_check(key, config, now).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    key,
                    error = %e,
                    failure_mode = ?self.failure_mode,
                    "token bucket check could not reach the counter store"
                );
                RateLimitResult::store_failure(
                    self.failure_mode,
                    config.bucket_size,
                    reset_at(now, config.burst_window_ms),
                )
            }
        }
    }

    /// Read the bucket without consuming or persisting anything. The returned
    /// state already includes refill up to `now`.
    pub async fn peek(
        &self,
        key: &str,
        config: &BurstControlConfig,
    ) -> Result<BucketState, StoreError> {
        let now = now_millis();
        let state = self.load(key, config, now).await?;
        Ok(BucketState {
            tokens: state.refilled(config, now),
            last_refill: state.last_refill,
        })
    }

    async fn try_check(
        &self,
        key: &str,
        config: &BurstControlConfig,
        now: i64,
    ) -> Result<RateLimitResult, StoreError> {
        let state = self.load(key, config, now).await?;
        let tokens = state.refilled(config, now);
        let ttl = ttl_secs(config.burst_window_ms);

        if tokens < 1.0 {
            self.persist(key, now, tokens, ttl).await?;
            let wait_secs = (1.0 - tokens) / config.recovery_rate;
            let reset = ((now as f64 + wait_secs * 1000.0) / 1000.0).ceil() as i64;
            return Ok(RateLimitResult::rejected(
                config.bucket_size,
                config.bucket_size,
                reset,
                wait_secs.ceil() as u64,
            ));
        }

        let left = tokens - 1.0;
        self.persist(key, now, left, ttl).await?;

        let remaining = (left.floor() as u64).min(config.bucket_size);
        Ok(RateLimitResult::admitted(
            config.bucket_size - remaining,
            config.bucket_size,
            reset_at(now, config.burst_window_ms),
        ))
    }

    async fn load(
        &self,
        key: &str,
        config: &BurstControlConfig,
        now: i64,
    ) -> Result<BucketState, StoreError> {
        let tokens_key = tokens_key(key);
        let refill_key = last_refill_key(key);
        let (last_refill, tokens) =
            tokio::try_join!(self.store.get(&refill_key), self.store.get(&tokens_key))?;

        let last_refill = match last_refill {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| StoreError::Corrupt {
                key: refill_key,
                value: raw,
            })?,
            None => now,
        };
        let tokens = match tokens {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|t| t.is_finite())
                .ok_or(StoreError::Corrupt {
                    key: tokens_key,
                    value: raw,
                })?,
            None => config.bucket_size as f64,
        };

        Ok(BucketState {
            tokens,
            last_refill,
        })
    }

    async fn persist(&self, key: &str, now: i64, tokens: f64, ttl: u64) -> Result<(), StoreError> {
        let tokens_key = tokens_key(key);
        let refill_key = last_refill_key(key);
        let tokens = tokens.to_string();
        let now = now.to_string();
        tokio::try_join!(
            self.store.set_ex(&refill_key, &now, ttl),
            self.store.set_ex(&tokens_key, &tokens, ttl),
        )?;
        Ok(())
    }
}
