use std::sync::Arc;

use quotaguard_common::FailureMode;
use tracing::warn;

use crate::store::{window_start, CounterStore, MarkerOutcome};
use crate::types::{now_millis, reset_at, seconds_until, RateLimitResult};

/// A sliding-window log limiter.
///
/// Each admitted request leaves one timestamped marker in a sorted set stored
/// under the key. A request is admitted while fewer than `max_requests`
/// markers fall inside `[now - window, now]`. Rejected requests leave no
/// trace, so a caller hammering a full window does not extend its own
/// lockout.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    failure_mode: FailureMode,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, failure_mode: FailureMode) -> Self {
        Self {
            store,
            failure_mode,
        }
    }

    /// Check the window at `key`.
    ///
    /// With `increment == false` the window is only counted, which is how
    /// status queries observe usage without consuming quota.
    pub async fn check(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u64,
        increment: bool,
    ) -> RateLimitResult {
        let now = now_millis();
        let reset = reset_at(now, window_ms);

        let outcome = if increment {
            self.store
                .admit_marker(key, now, window_ms, max_requests, &marker(now))
                .await
        } else {
            self.store
                .zcount(key, window_start(now, window_ms))
                .await
                .map(|count| MarkerOutcome {
                    count,
                    inserted: false,
                })
        };

        match outcome {
            Ok(outcome) if outcome.inserted || (!increment && outcome.count < max_requests) => {
                RateLimitResult::admitted(outcome.count, max_requests, reset)
            }
            Ok(outcome) => RateLimitResult::rejected(
                outcome.count,
                max_requests,
                reset,
                seconds_until(now, reset),
            ),
            Err(e) => {
                warn!(
                    key,
                    error = %e,
                    failure_mode = ?self.failure_mode,
                    "sliding window check could not reach the counter store"
                );
                RateLimitResult::store_failure(self.failure_mode, max_requests, reset)
            }
        }
    }
}

/// Unique member for a window entry: the timestamp plus a random suffix so
/// that concurrent requests in the same millisecond stay distinct.
fn marker(now_ms: i64) -> String {
    format!("{}-{}", now_ms, rand::random::<u64>())
}
