use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use quotaguard_common::{
    BurstControlConfig, QuotaError, QuotaResult, RateLimitConfig, RateLimitRule,
    RateLimitSettings, Scope, SimulationConfig, UnknownIdentityPolicy,
};
use tracing::{debug, info, warn};

use crate::keys::{self, RequestContext, UNKNOWN};
use crate::rules::RuleMatcher;
use crate::sliding_window::SlidingWindowLimiter;
use crate::store::{ttl_secs, CounterStore};
use crate::token_bucket::TokenBucketLimiter;
use crate::types::{
    now_millis, reset_at, ActiveLimit, Admission, BurstControlStatus, HealthStatus, QuotaHealth,
    RateLimitResult, RateLimitStats, RateLimitStatus, SimulationReport, WindowUsage,
};

/// Usage share at which a limit counts as "near".
const NEAR_LIMIT_PERCENT: f64 = 80.0;

/// The admission-control facade.
///
/// Composes the rule table, key generation, the sliding-window limiter and
/// the token-bucket limiter behind one cheaply cloneable handle. Request-path
/// checks never fail: store errors are absorbed by the limiters according to
/// the configured failure mode. Administrative operations return
/// [`QuotaResult`] so callers can report configuration, validation and store
/// problems.
#[derive(Clone)]
pub struct RateLimitService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: Arc<dyn CounterStore>,
    matcher: RuleMatcher,
    windows: SlidingWindowLimiter,
    buckets: TokenBucketLimiter,
    burst_controls: BTreeMap<String, BurstControlConfig>,
    enabled: bool,
    unknown_identity: UnknownIdentityPolicy,
    simulation: SimulationConfig,
}

impl RateLimitService {
    pub fn new(store: Arc<dyn CounterStore>, settings: &RateLimitSettings) -> Self {
        info!(
            rules = settings.rules.len(),
            burst_controls = settings.burst_controls.len(),
            enabled = settings.enabled,
            failure_mode = ?settings.failure_mode,
            unknown_identity = ?settings.unknown_identity,
            "creating rate limit service"
        );
        Self {
            inner: Arc::new(ServiceInner {
                windows: SlidingWindowLimiter::new(Arc::clone(&store), settings.failure_mode),
                buckets: TokenBucketLimiter::new(Arc::clone(&store), settings.failure_mode),
                store,
                matcher: RuleMatcher::new(settings.rules.clone()),
                burst_controls: settings.burst_controls.clone(),
                enabled: settings.enabled,
                unknown_identity: settings.unknown_identity,
                simulation: settings.simulation.clone(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn rules(&self) -> &[RateLimitRule] {
        self.inner.matcher.rules()
    }

    /// The rule [`evaluate`](Self::evaluate) would apply, if any.
    pub fn find_rule(&self, path: &str, method: &str) -> Option<&RateLimitRule> {
        if !self.inner.enabled {
            return None;
        }
        self.inner.matcher.find(path, method)
    }

    pub fn burst_controls(&self) -> &BTreeMap<String, BurstControlConfig> {
        &self.inner.burst_controls
    }

    pub fn simulation(&self) -> &SimulationConfig {
        &self.inner.simulation
    }

    pub async fn ping(&self) -> QuotaResult<()> {
        self.inner.store.ping().await?;
        Ok(())
    }

    /// Run one inbound operation through the rule table.
    ///
    /// The main window is consulted first, then the rule's burst window, then
    /// the rule's named burst control. A request rejected at a later stage
    /// keeps the markers recorded by the earlier ones.
    pub async fn evaluate(
        &self,
        path: &str,
        method: &str,
        ctx: &RequestContext,
    ) -> QuotaResult<Admission> {
        if !self.inner.enabled {
            return Ok(Admission::Unmatched);
        }
        let Some(rule) = self.inner.matcher.find(path, method) else {
            debug!(path, method, "no rate limit rule matched");
            return Ok(Admission::Unmatched);
        };

        let generated = keys::generate_key(rule, ctx);
        let scope = rule.scope;

        if generated.anonymous && self.inner.unknown_identity == UnknownIdentityPolicy::Reject {
            warn!(key = %generated.key, path, "rejecting request without a resolvable identity");
            let now = now_millis();
            let limit = rule.config.max_requests;
            return Ok(Admission::Rejected {
                scope,
                key: generated.key,
                result: RateLimitResult::rejected(
                    limit,
                    limit,
                    reset_at(now, rule.config.window_ms),
                    ttl_secs(rule.config.window_ms),
                ),
            });
        }

        let result = self.check(&generated.key, &rule.config).await;
        if !result.allowed {
            return Ok(Admission::Rejected {
                scope,
                key: generated.key,
                result,
            });
        }

        if let Some(ref operation_type) = rule.operation_type {
            let organization_id = ctx.organization_id().unwrap_or_else(|| UNKNOWN.to_string());
            let channel_id = match scope {
                Scope::Channel => Some(ctx.channel_id().unwrap_or_else(|| UNKNOWN.to_string())),
                _ => None,
            };
            let bucket = self
                .check_burst_control(operation_type, &organization_id, channel_id.as_deref())
                .await?;
            if !bucket.allowed {
                return Ok(Admission::Rejected {
                    scope,
                    key: generated.key,
                    result: bucket,
                });
            }
        }

        debug!(key = %generated.key, current = result.current, limit = result.limit, "request admitted");
        Ok(Admission::Admitted {
            scope,
            key: generated.key,
            result,
        })
    }

    /// Consume one slot of the main window at `<key>:main` and, when the
    /// config has a burst allowance, one slot of `<key>:burst`.
    ///
    /// The returned counters describe the main window unless the burst window
    /// rejected the request.
    pub async fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitResult {
        let main = self
            .inner
            .windows
            .check(&keys::main_key(key), config.window_ms, config.max_requests, true)
            .await;
        if !main.allowed {
            debug!(key, current = main.current, limit = main.limit, "main window exhausted");
            return main;
        }

        if let Some((burst_limit, burst_window_ms)) = config.burst() {
            let burst = self
                .inner
                .windows
                .check(&keys::burst_key(key), burst_window_ms, burst_limit, true)
                .await;
            if !burst.allowed {
                debug!(key, current = burst.current, limit = burst.limit, "burst window exhausted");
                return burst;
            }
        }

        main
    }

    /// Take one token from the bucket at `key`.
    pub async fn check_burst(&self, key: &str, config: &BurstControlConfig) -> RateLimitResult {
        self.inner.buckets.check(key, config).await
    }

    /// Take one token from the named burst control's bucket for an
    /// organization, or for one of its channels.
    pub async fn check_burst_control(
        &self,
        operation_type: &str,
        organization_id: &str,
        channel_id: Option<&str>,
    ) -> QuotaResult<RateLimitResult> {
        let config = self.burst_control(operation_type)?;
        let key = keys::bucket_key(operation_type, organization_id, channel_id);
        Ok(self.check_burst(&key, config).await)
    }

    /// Check an organization directly against the rule for `path`. Paths
    /// whose rule is not organization-scoped are not limited here.
    pub async fn check_organization(
        &self,
        organization_id: &str,
        path: &str,
        method: &str,
    ) -> RateLimitResult {
        match self.inner.matcher.find(path, method) {
            Some(rule) if rule.scope == Scope::Organization => {
                let ctx = RequestContext::default().with_header("x-organization-id", organization_id);
                let key = keys::generate_key(rule, &ctx).key;
                self.check(&key, &rule.config).await
            }
            _ => RateLimitResult::unlimited(),
        }
    }

    /// Check a channel directly against the rule for `path`. Paths whose
    /// rule is not channel-scoped are not limited here.
    pub async fn check_channel(
        &self,
        organization_id: &str,
        channel_id: &str,
        path: &str,
        method: &str,
    ) -> RateLimitResult {
        match self.inner.matcher.find(path, method) {
            Some(rule) if rule.scope == Scope::Channel => {
                let ctx = RequestContext::default()
                    .with_header("x-organization-id", organization_id)
                    .with_header("x-channel-id", channel_id);
                let key = keys::generate_key(rule, &ctx).key;
                self.check(&key, &rule.config).await
            }
            _ => RateLimitResult::unlimited(),
        }
    }

    /// Usage of both windows at `key` without recording anything.
    pub async fn status(&self, key: &str, config: &RateLimitConfig) -> QuotaResult<RateLimitStatus> {
        let main = self
            .inner
            .windows
            .check(&keys::main_key(key), config.window_ms, config.max_requests, false)
            .await;
        if main.degraded {
            return Err(QuotaError::StoreUnavailable(format!(
                "could not read usage for '{}'",
                key
            )));
        }

        let burst = match config.burst() {
            Some((burst_limit, burst_window_ms)) => {
                let burst = self
                    .inner
                    .windows
                    .check(&keys::burst_key(key), burst_window_ms, burst_limit, false)
                    .await;
                if burst.degraded {
                    return Err(QuotaError::StoreUnavailable(format!(
                        "could not read burst usage for '{}'",
                        key
                    )));
                }
                Some(WindowUsage {
                    current: burst.current,
                    limit: burst.limit,
                    remaining: burst.remaining,
                })
            }
            None => None,
        };

        Ok(RateLimitStatus {
            current: main.current,
            limit: main.limit,
            remaining: main.remaining,
            reset: main.reset,
            burst,
        })
    }

    /// Status of the key an organization (and optionally a channel) would
    /// use on `path`.
    pub async fn organization_status(
        &self,
        organization_id: &str,
        path: &str,
        method: &str,
        channel_id: Option<&str>,
    ) -> QuotaResult<RateLimitStatus> {
        let rule = self
            .inner
            .matcher
            .find(path, method)
            .ok_or_else(|| QuotaError::NoMatchingRule {
                path: path.to_string(),
                method: method.to_string(),
            })?;

        let mut ctx = RequestContext::default().with_header("x-organization-id", organization_id);
        if let Some(channel) = channel_id {
            ctx = ctx.with_header("x-channel-id", channel);
        }
        let key = keys::generate_key(rule, &ctx).key;
        self.status(&key, &rule.config).await
    }

    /// Every logical window key stored for an organization.
    pub async fn organization_keys(&self, organization_id: &str) -> QuotaResult<Vec<String>> {
        let stored = self
            .inner
            .store
            .keys(&keys::organization_pattern(organization_id))
            .await?;
        let logical: BTreeSet<String> = stored
            .iter()
            .filter_map(|key| keys::logical_key(key))
            .map(str::to_string)
            .collect();
        Ok(logical.into_iter().collect())
    }

    /// Current usage of every window key of an organization.
    pub async fn stats(&self, organization_id: &str) -> QuotaResult<RateLimitStats> {
        let logical = self.organization_keys(organization_id).await?;
        let mut active_limits = Vec::with_capacity(logical.len());

        for key in &logical {
            let Some(rule) = keys::parse_key(key)
                .and_then(|(scope, path)| self.inner.matcher.find_by_key(scope, path))
            else {
                debug!(key = %key, "no configured rule owns stored key; skipping");
                continue;
            };
            let status = self.status(key, &rule.config).await?;
            active_limits.push(ActiveLimit {
                key: key.clone(),
                current: status.current,
                limit: status.limit,
                remaining: status.remaining,
                reset: status.reset,
            });
        }

        Ok(RateLimitStats {
            total_keys: logical.len(),
            active_limits,
        })
    }

    /// Summarize how close an organization is to its limits.
    pub async fn health(&self, organization_id: &str) -> QuotaResult<QuotaHealth> {
        let stats = self.stats(organization_id).await?;
        let mut near_limit = 0;
        let mut at_limit = 0;
        let mut recommendations = Vec::new();

        for limit in &stats.active_limits {
            let usage = limit.usage_percent();
            if usage >= 100.0 {
                at_limit += 1;
                recommendations.push(format!("Rate limit exceeded for {}", limit.key));
            } else if usage >= NEAR_LIMIT_PERCENT {
                near_limit += 1;
                recommendations.push(format!(
                    "Rate limit approaching limit for {} ({:.1}%)",
                    limit.key, usage
                ));
            }
        }
        if stats.active_limits.is_empty() {
            recommendations.push("No active rate limits found".into());
        }

        let status = if at_limit > 0 {
            HealthStatus::Critical
        } else if near_limit > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        Ok(QuotaHealth {
            status,
            active_limits: stats.active_limits.len(),
            near_limit,
            at_limit,
            recommendations,
        })
    }

    /// Delete both windows of a logical key. Returns the number of stored
    /// keys removed.
    pub async fn reset(&self, key: &str) -> QuotaResult<u64> {
        let removed = self
            .inner
            .store
            .del(&[keys::main_key(key), keys::burst_key(key)])
            .await?;
        info!(key, removed, "rate limit reset");
        Ok(removed)
    }

    /// Reset every logical key of an organization, optionally only those
    /// whose key contains `path_filter`. Returns the number of logical keys
    /// reset.
    pub async fn reset_organization(
        &self,
        organization_id: &str,
        path_filter: Option<&str>,
    ) -> QuotaResult<usize> {
        let targets: Vec<String> = self
            .organization_keys(organization_id)
            .await?
            .into_iter()
            .filter(|key| path_filter.map_or(true, |p| key.contains(p)))
            .collect();

        let stored: Vec<String> = targets
            .iter()
            .flat_map(|key| [keys::main_key(key), keys::burst_key(key)])
            .collect();
        self.inner.store.del(&stored).await?;

        info!(
            organization_id,
            path_filter = path_filter.unwrap_or("*"),
            reset_keys = targets.len(),
            "organization rate limits reset"
        );
        Ok(targets.len())
    }

    /// Issue `requests` checks against `key` with the configured delay
    /// between them and tabulate the outcomes.
    pub async fn simulate(
        &self,
        key: &str,
        config: &RateLimitConfig,
        requests: u32,
    ) -> QuotaResult<SimulationReport> {
        let max = self.inner.simulation.max_requests;
        if requests == 0 || requests > max {
            return Err(QuotaError::Validation(format!(
                "requests must be between 1 and {}",
                max
            )));
        }
        config
            .validate()
            .map_err(|e| QuotaError::Validation(e.to_string()))?;

        let delay = Duration::from_millis(self.inner.simulation.delay_ms);
        let mut report = SimulationReport {
            successful: 0,
            blocked: 0,
            results: Vec::with_capacity(requests as usize),
        };

        for i in 0..requests {
            let result = self.check(key, config).await;
            if result.allowed {
                report.successful += 1;
            } else {
                report.blocked += 1;
            }
            report.results.push(result);
            if i + 1 < requests && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        info!(
            key,
            requests,
            successful = report.successful,
            blocked = report.blocked,
            "rate limit simulation finished"
        );
        Ok(report)
    }

    /// Read a named burst control's bucket without consuming a token.
    pub async fn burst_status(
        &self,
        operation_type: &str,
        organization_id: &str,
        channel_id: Option<&str>,
    ) -> QuotaResult<BurstControlStatus> {
        let config = self.burst_control(operation_type)?;
        let key = keys::bucket_key(operation_type, organization_id, channel_id);
        let state = self.inner.buckets.peek(&key, config).await?;

        let time_to_next_token = if state.tokens >= config.bucket_size as f64 {
            0.0
        } else {
            (1.0 - state.tokens.fract()) / config.recovery_rate
        };

        Ok(BurstControlStatus {
            operation_type: operation_type.to_string(),
            organization_id: organization_id.to_string(),
            channel_id: channel_id.map(str::to_string),
            config: *config,
            current_tokens: state.tokens,
            last_refill: state.last_refill,
            time_to_next_token,
        })
    }

    fn burst_control(&self, operation_type: &str) -> QuotaResult<&BurstControlConfig> {
        self.inner
            .burst_controls
            .get(operation_type)
            .ok_or_else(|| QuotaError::UnknownOperationType(operation_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCounterStore;
    use quotaguard_common::FailureMode;

    fn publish_rule() -> RateLimitRule {
        RateLimitRule {
            path_prefix: "/api/publish".into(),
            method: None,
            scope: Scope::Organization,
            config: RateLimitConfig::new(60_000, 5).with_burst(15, 5_000),
            operation_type: None,
            path_pattern: None,
        }
    }

    fn settings(rules: Vec<RateLimitRule>) -> RateLimitSettings {
        let mut settings = RateLimitSettings {
            rules,
            ..Default::default()
        };
        settings.simulation.delay_ms = 0;
        settings.burst_controls.insert(
            "publish".into(),
            BurstControlConfig {
                bucket_size: 2,
                recovery_rate: 0.001,
                max_burst: 50,
                burst_window_ms: 5_000,
            },
        );
        settings
    }

    fn service(rules: Vec<RateLimitRule>) -> (RateLimitService, Arc<InMemoryCounterStore>) {
        let store = Arc::new(InMemoryCounterStore::new());
        (RateLimitService::new(store.clone(), &settings(rules)), store)
    }

    fn acme() -> RequestContext {
        RequestContext::default().with_user("u1", Some("acme"))
    }

    #[tokio::test]
    async fn unmatched_path_is_unlimited() {
        let (service, _) = service(vec![publish_rule()]);
        let admission = service.evaluate("/api/users", "GET", &acme()).await.unwrap();
        assert_eq!(admission, Admission::Unmatched);
        assert_eq!(admission.into_result(), RateLimitResult::unlimited());
    }

    #[tokio::test]
    async fn organization_quota_scenario() {
        let (service, _) = service(vec![publish_rule()]);

        for i in 1..=5 {
            let admission = service.evaluate("/api/publish", "POST", &acme()).await.unwrap();
            let result = admission.result().unwrap();
            assert!(result.allowed, "request {} should be admitted", i);
            assert_eq!(result.current, i);
        }

        let admission = service.evaluate("/api/publish", "POST", &acme()).await.unwrap();
        assert!(admission.is_rejected());
        let result = admission.into_result();
        assert_eq!(result.limit, 5);
        assert_eq!(result.remaining, 0);
        assert!(result.retry_after.is_some());
    }

    #[tokio::test]
    async fn burst_window_rejection_keeps_main_marker() {
        let rule = RateLimitRule {
            config: RateLimitConfig::new(60_000, 10).with_burst(10, 1_000),
            ..publish_rule()
        };
        let (service, store) = service(vec![rule.clone()]);
        let key = keys::generate_key(&rule, &acme()).key;

        // Fill the burst window behind the main window's back.
        let now = now_millis();
        for i in 0..10 {
            store
                .zadd(&keys::burst_key(&key), now, &format!("b{}", i))
                .await
                .unwrap();
        }

        let result = service.check(&key, &rule.config).await;
        assert!(!result.allowed);
        assert_eq!(result.limit, 10);
        assert_eq!(store.zcard(&keys::main_key(&key)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn operation_type_consumes_bucket_after_windows() {
        let rule = RateLimitRule {
            operation_type: Some("publish".into()),
            ..publish_rule()
        };
        let (service, store) = service(vec![rule]);

        assert!(!service.evaluate("/api/publish", "POST", &acme()).await.unwrap().is_rejected());
        assert!(!service.evaluate("/api/publish", "POST", &acme()).await.unwrap().is_rejected());

        let admission = service.evaluate("/api/publish", "POST", &acme()).await.unwrap();
        assert!(admission.is_rejected());
        let result = admission.into_result();
        assert_eq!(result.limit, 2);

        let tokens = store
            .get(&keys::tokens_key("burst:publish:org:acme"))
            .await
            .unwrap();
        assert!(tokens.is_some());
    }

    #[tokio::test]
    async fn anonymous_callers_share_quota_by_default() {
        let (service, _) = service(vec![publish_rule()]);
        let anonymous = RequestContext::default();

        let first = service.evaluate("/api/publish", "POST", &anonymous).await.unwrap();
        match first {
            Admission::Admitted { key, .. } => {
                assert_eq!(key, "rate_limit:organization:/api/publish:org:unknown")
            }
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn anonymous_callers_rejected_when_configured() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut settings = settings(vec![publish_rule()]);
        settings.unknown_identity = UnknownIdentityPolicy::Reject;
        let service = RateLimitService::new(store.clone(), &settings);

        let admission = service
            .evaluate("/api/publish", "POST", &RequestContext::default())
            .await
            .unwrap();
        assert!(admission.is_rejected());
        assert!(store.keys("*").await.unwrap().is_empty());

        assert!(!service.evaluate("/api/publish", "POST", &acme()).await.unwrap().is_rejected());
    }

    #[tokio::test]
    async fn disabled_service_admits_everything() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut settings = settings(vec![publish_rule()]);
        settings.enabled = false;
        let service = RateLimitService::new(store, &settings);

        for _ in 0..10 {
            assert_eq!(
                service.evaluate("/api/publish", "POST", &acme()).await.unwrap(),
                Admission::Unmatched
            );
        }
    }

    #[tokio::test]
    async fn status_is_read_only() {
        let (service, _) = service(vec![publish_rule()]);
        let rule = publish_rule();
        let key = keys::generate_key(&rule, &acme()).key;

        service.check(&key, &rule.config).await;
        service.check(&key, &rule.config).await;

        let first = service.status(&key, &rule.config).await.unwrap();
        let second = service.status(&key, &rule.config).await.unwrap();
        assert_eq!(first.current, 2);
        assert_eq!(first.remaining, 3);
        assert_eq!(first.current, second.current);
        assert_eq!(first.burst.unwrap().current, 2);
    }

    #[tokio::test]
    async fn status_reports_store_outage() {
        let (service, store) = service(vec![publish_rule()]);
        store.set_available(false);
        let err = service
            .status("rate_limit:global:/x", &RateLimitConfig::new(1_000, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn fail_open_admits_during_outage() {
        let (service, store) = service(vec![publish_rule()]);
        store.set_available(false);

        for _ in 0..10 {
            let admission = service.evaluate("/api/publish", "POST", &acme()).await.unwrap();
            assert!(admission.result().unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn fail_closed_rejects_during_outage() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut settings = settings(vec![publish_rule()]);
        settings.failure_mode = FailureMode::Closed;
        let service = RateLimitService::new(store.clone(), &settings);
        store.set_available(false);

        let admission = service.evaluate("/api/publish", "POST", &acme()).await.unwrap();
        assert!(admission.is_rejected());
    }

    #[tokio::test]
    async fn direct_checks_respect_rule_scope() {
        let channel_rule = RateLimitRule {
            path_prefix: "/api/publish/twitter".into(),
            scope: Scope::Channel,
            config: RateLimitConfig::new(60_000, 1),
            ..publish_rule()
        };
        let (service, _) = service(vec![channel_rule, publish_rule()]);

        assert!(service.check_channel("acme", "c1", "/api/publish/twitter", "POST").await.allowed);
        assert!(!service.check_channel("acme", "c1", "/api/publish/twitter", "POST").await.allowed);
        assert!(service.check_channel("acme", "c2", "/api/publish/twitter", "POST").await.allowed);

        // Channel rule is not organization-scoped, so it is not enforced here.
        let result = service
            .check_organization("acme", "/api/publish/twitter", "POST")
            .await;
        assert_eq!(result, RateLimitResult::unlimited());

        let result = service.check_organization("acme", "/api/publish/x", "POST").await;
        assert_eq!(result.current, 1);
    }

    #[tokio::test]
    async fn stats_health_and_reset() {
        let other = RateLimitRule {
            path_prefix: "/api/generate".into(),
            config: RateLimitConfig::new(60_000, 2),
            ..publish_rule()
        };
        let (service, _) = service(vec![publish_rule(), other]);

        for _ in 0..2 {
            service.evaluate("/api/generate", "POST", &acme()).await.unwrap();
        }
        service.evaluate("/api/publish", "POST", &acme()).await.unwrap();
        service
            .evaluate("/api/publish", "POST", &RequestContext::default().with_user("u2", Some("other")))
            .await
            .unwrap();

        let stats = service.stats("acme").await.unwrap();
        assert_eq!(stats.total_keys, 2);
        let generate = stats
            .active_limits
            .iter()
            .find(|l| l.key.contains("/api/generate"))
            .unwrap();
        assert_eq!((generate.current, generate.limit, generate.remaining), (2, 2, 0));

        let health = service.health("acme").await.unwrap();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.at_limit, 1);

        let reset = service
            .reset_organization("acme", Some("/api/generate"))
            .await
            .unwrap();
        assert_eq!(reset, 1);
        assert_eq!(service.stats("acme").await.unwrap().total_keys, 1);

        let health = service.health("acme").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);

        assert_eq!(service.reset_organization("acme", None).await.unwrap(), 1);
        let health = service.health("acme").await.unwrap();
        assert_eq!(health.active_limits, 0);
        assert!(health
            .recommendations
            .iter()
            .any(|r| r == "No active rate limits found"));

        // Other organizations are untouched.
        assert_eq!(service.stats("other").await.unwrap().total_keys, 1);
    }

    #[tokio::test]
    async fn reset_deletes_both_windows() {
        let (service, store) = service(vec![publish_rule()]);
        let rule = publish_rule();
        service.check("k", &rule.config).await;

        assert_eq!(service.reset("k").await.unwrap(), 2);
        assert_eq!(store.zcard("k:main").await.unwrap(), 0);
        assert_eq!(store.zcard("k:burst").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn simulate_tabulates_outcomes() {
        let (service, _) = service(vec![]);
        let report = service
            .simulate("sim", &RateLimitConfig::new(60_000, 3), 5)
            .await
            .unwrap();
        assert_eq!(report.successful, 3);
        assert_eq!(report.blocked, 2);
        assert_eq!(report.results.len(), 5);
    }

    #[tokio::test]
    async fn simulate_validates_before_touching_store() {
        let (service, store) = service(vec![]);
        let config = RateLimitConfig::new(60_000, 3);

        for requests in [0, 1_001] {
            let err = service.simulate("sim", &config, requests).await.unwrap_err();
            assert!(matches!(err, QuotaError::Validation(_)));
        }

        let huge_window = RateLimitConfig::new(i64::MAX as u64, 3);
        assert!(matches!(
            service.simulate("sim", &huge_window, 1).await,
            Err(QuotaError::Validation(_))
        ));

        let bad = RateLimitConfig::new(60_000, 3).with_burst(1, 1_000);
        assert!(matches!(
            service.simulate("sim", &bad, 1).await,
            Err(QuotaError::Validation(_))
        ));
        assert!(store.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn burst_status_reads_without_consuming() {
        let (service, _) = service(vec![]);

        let status = service.burst_status("publish", "acme", None).await.unwrap();
        assert_eq!(status.current_tokens, 2.0);
        assert_eq!(status.time_to_next_token, 0.0);

        service.check_burst_control("publish", "acme", None).await.unwrap();
        let status = service.burst_status("publish", "acme", None).await.unwrap();
        assert!(status.current_tokens < 2.0);
        assert!(status.time_to_next_token > 0.0);

        let again = service.burst_status("publish", "acme", None).await.unwrap();
        assert!(again.current_tokens >= status.current_tokens);
    }

    #[tokio::test]
    async fn time_to_next_token_counts_the_fractional_part() {
        let (service, store) = service(vec![]);
        let key = keys::bucket_key("publish", "acme", None);
        store
            .set_ex(&keys::tokens_key(&key), "1.5", 60)
            .await
            .unwrap();
        store
            .set_ex(&keys::last_refill_key(&key), &now_millis().to_string(), 60)
            .await
            .unwrap();

        let status = service.burst_status("publish", "acme", None).await.unwrap();
        assert!((status.current_tokens - 1.5).abs() < 0.01);
        // half a token at 0.001 tokens per second
        assert!((status.time_to_next_token - 500.0).abs() < 10.0);
    }

    #[tokio::test]
    async fn unknown_operation_type_is_reported() {
        let (service, _) = service(vec![]);
        assert!(matches!(
            service.burst_status("export", "acme", None).await,
            Err(QuotaError::UnknownOperationType(_))
        ));
        assert!(matches!(
            service.check_burst_control("export", "acme", None).await,
            Err(QuotaError::UnknownOperationType(_))
        ));
    }

    #[tokio::test]
    async fn organization_status_requires_matching_rule() {
        let (service, _) = service(vec![publish_rule()]);
        assert!(matches!(
            service.organization_status("acme", "/api/users", "GET", None).await,
            Err(QuotaError::NoMatchingRule { .. })
        ));

        service.evaluate("/api/publish", "POST", &acme()).await.unwrap();
        let status = service
            .organization_status("acme", "/api/publish", "POST", None)
            .await
            .unwrap();
        assert_eq!(status.current, 1);
    }
}
