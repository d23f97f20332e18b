use quotaguard_common::{BurstControlConfig, FailureMode, Scope};
use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// End of a window that starts now, in epoch seconds rounded up.
pub fn reset_at(now_ms: i64, window_ms: u64) -> i64 {
    let window_ms = i64::try_from(window_ms).unwrap_or(i64::MAX);
    now_ms.saturating_add(window_ms).saturating_add(999).div_euclid(1000)
}

/// Whole seconds from `now_ms` until `reset` (epoch seconds), at least one.
pub fn seconds_until(now_ms: i64, reset: i64) -> u64 {
    let millis = reset.saturating_mul(1000).saturating_sub(now_ms).max(0) as u64;
    millis.div_ceil(1000).max(1)
}

/// The answer to a single admission check.
///
/// `remaining` is always `limit - current`, floored at zero, and
/// `retry_after` is only present on rejections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds at which the relevant window ends.
    pub reset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Set when the store could not be consulted and the failure mode decided.
    #[serde(skip)]
    pub degraded: bool,
}

impl RateLimitResult {
    /// Allowed with every counter zeroed, for operations no rule covers.
    pub fn unlimited() -> Self {
        Self::admitted(0, 0, 0)
    }

    pub fn admitted(current: u64, limit: u64, reset: i64) -> Self {
        Self {
            allowed: true,
            current,
            limit,
            remaining: limit.saturating_sub(current),
            reset,
            retry_after: None,
            degraded: false,
        }
    }

    /// A rejection. `current` is clamped up to `limit` so the result never
    /// reports headroom it does not have.
    pub fn rejected(current: u64, limit: u64, reset: i64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            current: current.max(limit),
            limit,
            remaining: 0,
            reset,
            retry_after: Some(retry_after.max(1)),
            degraded: false,
        }
    }

    /// The result used when the counter store failed.
    pub fn store_failure(mode: FailureMode, limit: u64, reset: i64) -> Self {
        let mut result = match mode {
            FailureMode::Open => Self::admitted(0, limit, reset),
            FailureMode::Closed => Self::rejected(limit, limit, reset, 1),
        };
        result.degraded = true;
        result
    }
}

/// The outcome of running a request through the rule table.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// No rule covers the request.
    Unmatched,
    Admitted {
        scope: Scope,
        key: String,
        result: RateLimitResult,
    },
    Rejected {
        scope: Scope,
        key: String,
        result: RateLimitResult,
    },
}

impl Admission {
    pub fn result(&self) -> Option<&RateLimitResult> {
        match self {
            Admission::Unmatched => None,
            Admission::Admitted { result, .. } | Admission::Rejected { result, .. } => Some(result),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected { .. })
    }

    /// Flatten into a plain result; unmatched operations become
    /// [`RateLimitResult::unlimited`].
    pub fn into_result(self) -> RateLimitResult {
        match self {
            Admission::Unmatched => RateLimitResult::unlimited(),
            Admission::Admitted { result, .. } | Admission::Rejected { result, .. } => result,
        }
    }
}

/// JSON body returned with a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub status_code: u16,
    pub message: String,
    pub error: String,
    pub retry_after: u64,
}

impl RejectionBody {
    pub const DEFAULT_MESSAGE: &'static str = "Rate limit exceeded. Please try again later.";

    pub fn new(retry_after: u64) -> Self {
        Self {
            status_code: 429,
            message: Self::DEFAULT_MESSAGE.to_string(),
            error: "Too Many Requests".to_string(),
            retry_after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowUsage {
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Read-only view of a key's quota usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<WindowUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveLimit {
    pub key: String,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64,
}

impl ActiveLimit {
    /// Share of the quota in use, in percent.
    pub fn usage_percent(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.current as f64 / self.limit as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    pub total_keys: usize,
    pub active_limits: Vec<ActiveLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaHealth {
    pub status: HealthStatus,
    pub active_limits: usize,
    pub near_limit: usize,
    pub at_limit: usize,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub successful: u32,
    pub blocked: u32,
    pub results: Vec<RateLimitResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurstControlStatus {
    pub operation_type: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub config: BurstControlConfig,
    pub current_tokens: f64,
    /// Epoch milliseconds of the last persisted refill.
    pub last_refill: i64,
    /// Seconds until the next whole token, zero when the bucket is full.
    pub time_to_next_token: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_rounds_up_to_seconds() {
        assert_eq!(reset_at(1_000, 60_000), 61);
        assert_eq!(reset_at(1_001, 60_000), 62);
    }

    #[test]
    fn huge_windows_saturate_instead_of_overflowing() {
        let reset = reset_at(now_millis(), u64::MAX);
        assert_eq!(reset, i64::MAX / 1000);
        assert!(seconds_until(now_millis(), reset) > 1);
        assert!(seconds_until(0, i64::MAX) > 1);
    }

    #[test]
    fn seconds_until_is_at_least_one() {
        assert_eq!(seconds_until(61_000, 61), 1);
        assert_eq!(seconds_until(1_500, 61), 60);
        assert_eq!(seconds_until(100_000, 61), 1);
    }

    #[test]
    fn rejected_result_has_no_headroom() {
        let result = RateLimitResult::rejected(3, 5, 100, 0);
        assert_eq!(result.current, 5);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after, Some(1));
    }

    #[test]
    fn result_serializes_camel_case_without_internal_fields() {
        let result = RateLimitResult::rejected(5, 5, 1_700_000_060, 42);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["retryAfter"], 42);
        assert!(json.get("degraded").is_none());

        let admitted = serde_json::to_value(RateLimitResult::admitted(1, 5, 10)).unwrap();
        assert!(admitted.get("retryAfter").is_none());
        assert_eq!(admitted["remaining"], 4);
    }

    #[test]
    fn failure_modes() {
        let open = RateLimitResult::store_failure(FailureMode::Open, 10, 0);
        assert!(open.allowed && open.degraded);
        assert_eq!(open.remaining, 10);

        let closed = RateLimitResult::store_failure(FailureMode::Closed, 10, 0);
        assert!(!closed.allowed && closed.degraded);
    }

    #[test]
    fn rejection_body_shape() {
        let json = serde_json::to_value(RejectionBody::new(7)).unwrap();
        assert_eq!(json["statusCode"], 429);
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["retryAfter"], 7);
    }
}
