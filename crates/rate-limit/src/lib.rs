//! Admission control for quotaguard.
//!
//! This crate decides, for every inbound operation, whether it may proceed.
//! Two algorithms are composed behind the [`RateLimitService`] facade:
//!
//! - **Sliding window log** -- at most N operations in any rolling window,
//!   with an optional tighter burst window nested inside it.
//!
//! - **Token bucket** -- continuous-refill shaping for named operation types
//!   such as `publish` or `generate`.
//!
//! All state lives in a shared [`CounterStore`] (Redis in production, an
//! in-memory [`DashMap`](dashmap::DashMap) store for single-process use and
//! tests), so every gateway instance sees the same quotas. Store failures are
//! absorbed at the limiter boundary and resolved by the configured
//! [`FailureMode`](quotaguard_common::FailureMode).

pub mod keys;
pub mod rules;
pub mod service;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;
pub mod types;

pub use keys::{generate_key, AuthenticatedUser, GeneratedKey, RequestContext};
pub use rules::RuleMatcher;
pub use service::RateLimitService;
pub use sliding_window::SlidingWindowLimiter;
pub use store::{build_store, CounterStore, InMemoryCounterStore, RedisCounterStore, StoreError};
pub use token_bucket::TokenBucketLimiter;
pub use types::{
    Admission, BurstControlStatus, HealthStatus, QuotaHealth, RateLimitResult, RateLimitStats,
    RateLimitStatus, RejectionBody, SimulationReport,
};
