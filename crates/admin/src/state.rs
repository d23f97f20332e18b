use std::sync::Arc;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use quotaguard_common::AppConfig;
use quotaguard_rate_limit::RateLimitService;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Central application state: the loaded configuration, the admission
/// service shared with the gateway, and metrics.
pub struct AppState {
    pub config: AppConfig,
    pub service: RateLimitService,
    pub metrics: AdmissionMetrics,
    pub start_time: std::time::Instant,
}

/// Prometheus metrics collected on the request path.
pub struct AdmissionMetrics {
    pub registry: Registry,
    pub requests_total: IntCounter,
    pub admitted_total: IntCounterVec,
    pub rejected_total: IntCounterVec,
    pub unmatched_total: IntCounter,
    pub degraded_total: IntCounter,
    pub errors_total: IntCounter,
    pub decision_duration: Histogram,
    pub upstream_errors: IntCounter,
}

impl AdmissionMetrics {
    /// Create a new AdmissionMetrics instance with all counters and
    /// histograms registered against a fresh Prometheus registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "quotaguard_requests_total",
            "Total number of requests seen by the admission middleware",
        ))
        .expect("failed to create requests_total counter");

        let admitted_total = IntCounterVec::new(
            Opts::new(
                "quotaguard_admitted_total",
                "Requests admitted by a rate limit rule",
            ),
            &["scope"],
        )
        .expect("failed to create admitted_total counter");

        let rejected_total = IntCounterVec::new(
            Opts::new(
                "quotaguard_rejected_total",
                "Requests rejected with 429 by a rate limit rule",
            ),
            &["scope"],
        )
        .expect("failed to create rejected_total counter");

        let unmatched_total = IntCounter::with_opts(Opts::new(
            "quotaguard_unmatched_total",
            "Requests no rate limit rule applied to",
        ))
        .expect("failed to create unmatched_total counter");

        let degraded_total = IntCounter::with_opts(Opts::new(
            "quotaguard_degraded_total",
            "Decisions made by the failure mode because the counter store was unreachable",
        ))
        .expect("failed to create degraded_total counter");

        let errors_total = IntCounter::with_opts(Opts::new(
            "quotaguard_errors_total",
            "Admission checks that failed and let the request through unlimited",
        ))
        .expect("failed to create errors_total counter");

        let decision_duration = Histogram::with_opts(
            HistogramOpts::new(
                "quotaguard_decision_duration_seconds",
                "Time spent deciding whether to admit a request",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]),
        )
        .expect("failed to create decision_duration histogram");

        let upstream_errors = IntCounter::with_opts(Opts::new(
            "quotaguard_upstream_errors_total",
            "Requests that could not be forwarded to an upstream",
        ))
        .expect("failed to create upstream_errors counter");

        registry.register(Box::new(requests_total.clone())).expect("failed to register requests_total");
        registry.register(Box::new(admitted_total.clone())).expect("failed to register admitted_total");
        registry.register(Box::new(rejected_total.clone())).expect("failed to register rejected_total");
        registry.register(Box::new(unmatched_total.clone())).expect("failed to register unmatched_total");
        registry.register(Box::new(degraded_total.clone())).expect("failed to register degraded_total");
        registry.register(Box::new(errors_total.clone())).expect("failed to register errors_total");
        registry.register(Box::new(decision_duration.clone())).expect("failed to register decision_duration");
        registry.register(Box::new(upstream_errors.clone())).expect("failed to register upstream_errors");

        Self {
            registry,
            requests_total,
            admitted_total,
            rejected_total,
            unmatched_total,
            degraded_total,
            errors_total,
            decision_duration,
            upstream_errors,
        }
    }
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new(config: AppConfig, service: RateLimitService) -> Self {
        Self {
            config,
            service,
            metrics: AdmissionMetrics::new(),
            start_time: std::time::Instant::now(),
        }
    }
}
