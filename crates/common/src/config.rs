use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{QuotaError, QuotaResult};

/// Top-level quotaguard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on request bodies buffered to look up a channel id.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub servers: Vec<UpstreamServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamServer {
    pub addr: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    pub upstream: String,
}

/// Connection settings for the shared counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Bound on every individual store command.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_store_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: default_store_url(),
            timeout_ms: default_store_timeout_ms(),
            connect_timeout_ms: default_store_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_mode")]
    pub failure_mode: FailureMode,
    #[serde(default = "default_unknown_identity")]
    pub unknown_identity: UnknownIdentityPolicy,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
    #[serde(default)]
    pub burst_controls: BTreeMap<String, BurstControlConfig>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_mode: default_failure_mode(),
            unknown_identity: default_unknown_identity(),
            simulation: SimulationConfig::default(),
            rules: vec![],
            burst_controls: BTreeMap::new(),
        }
    }
}

/// What a limiter answers when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the operation.
    Open,
    /// Reject the operation.
    Closed,
}

/// How callers without any resolvable identity are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownIdentityPolicy {
    /// Pool them under the `unknown` dimension and share one quota.
    Shared,
    /// Reject them outright on rate-limited paths.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_simulation_delay_ms")]
    pub delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_requests: default_simulation_max_requests(),
            delay_ms: default_simulation_delay_ms(),
        }
    }
}

/// The dimension a quota is tracked over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Organization,
    Channel,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Organization => "organization",
            Scope::Channel => "channel",
            Scope::User => "user",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest window a quota or burst control may span: 30 days.
pub const MAX_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// A path-based rate limit entry. Rules are matched in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(alias = "path", alias = "pathPrefix")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub scope: Scope,
    pub config: RateLimitConfig,
    /// Burst control consumed once both windows admit the request.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "operationType")]
    pub operation_type: Option<String>,
    /// Segment template such as `/api/channels/{channelId}/publish` whose
    /// `{name}` segments are captured as path parameters.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "pathPattern")]
    pub path_pattern: Option<String>,
}

impl RateLimitRule {
    /// Returns `true` if this rule applies to `path` and `method`.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        path.starts_with(&self.path_prefix)
            && self
                .method
                .as_deref()
                .map_or(true, |m| m.eq_ignore_ascii_case(method))
    }

    /// Path parameters captured by `path_pattern`. Literal segments must
    /// match exactly; trailing path segments beyond the template are ignored.
    /// Empty when there is no template or it does not fit `path`.
    pub fn path_params(&self, path: &str) -> HashMap<String, String> {
        let Some(pattern) = self.path_pattern.as_deref() else {
            return HashMap::new();
        };
        let mut segments = path.split('/');
        let mut params = HashMap::new();
        for expected in pattern.split('/') {
            let Some(actual) = segments.next() else {
                return HashMap::new();
            };
            match expected.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) if !actual.is_empty() => {
                    params.insert(name.to_string(), actual.to_string());
                }
                Some(_) => return HashMap::new(),
                None if expected == actual => {}
                None => return HashMap::new(),
            }
        }
        params
    }

    pub fn validate(&self) -> QuotaResult<()> {
        if !self.path_prefix.starts_with('/') {
            return Err(QuotaError::Config(format!(
                "rule path_prefix '{}' must start with '/'",
                self.path_prefix
            )));
        }
        if let Some(ref pattern) = self.path_pattern {
            let empty_name = pattern.split('/').any(|s| s == "{}");
            if !pattern.starts_with('/') || empty_name {
                return Err(QuotaError::Config(format!(
                    "rule '{}': invalid path_pattern '{}'",
                    self.path_prefix, pattern
                )));
            }
        }
        self.config.validate().map_err(|e| match e {
            QuotaError::Config(msg) => {
                QuotaError::Config(format!("rule '{}': {}", self.path_prefix, msg))
            }
            other => other,
        })
    }
}

/// Sliding-window quota with an optional nested burst allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(alias = "windowMs")]
    pub window_ms: u64,
    #[serde(alias = "maxRequests")]
    pub max_requests: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "burstLimit")]
    pub burst_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "burstWindowMs")]
    pub burst_window_ms: Option<u64>,
}

impl RateLimitConfig {
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            burst_limit: None,
            burst_window_ms: None,
        }
    }

    pub fn with_burst(mut self, burst_limit: u64, burst_window_ms: u64) -> Self {
        self.burst_limit = Some(burst_limit);
        self.burst_window_ms = Some(burst_window_ms);
        self
    }

    /// The `(limit, window_ms)` pair of the burst allowance, when both are set.
    pub fn burst(&self) -> Option<(u64, u64)> {
        match (self.burst_limit, self.burst_window_ms) {
            (Some(limit), Some(window_ms)) => Some((limit, window_ms)),
            _ => None,
        }
    }

    pub fn validate(&self) -> QuotaResult<()> {
        if self.window_ms == 0 || self.window_ms > MAX_WINDOW_MS {
            return Err(QuotaError::Config(format!(
                "window_ms ({}) must be within 1..={}",
                self.window_ms, MAX_WINDOW_MS
            )));
        }
        if self.max_requests == 0 {
            return Err(QuotaError::Config(
                "max_requests must be greater than 0".into(),
            ));
        }
        match (self.burst_limit, self.burst_window_ms) {
            (None, None) => Ok(()),
            (Some(_), None) | (None, Some(_)) => Err(QuotaError::Config(
                "burst_limit and burst_window_ms must be set together".into(),
            )),
            (Some(limit), Some(window_ms)) => {
                if limit < self.max_requests {
                    return Err(QuotaError::Config(format!(
                        "burst_limit ({}) must be >= max_requests ({})",
                        limit, self.max_requests
                    )));
                }
                if window_ms == 0 || window_ms > self.window_ms {
                    return Err(QuotaError::Config(format!(
                        "burst_window_ms ({}) must be within 1..={}",
                        window_ms, self.window_ms
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Token bucket shaping for a named operation type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BurstControlConfig {
    #[serde(alias = "bucketSize")]
    pub bucket_size: u64,
    /// Tokens added per second.
    #[serde(alias = "recoveryRate")]
    pub recovery_rate: f64,
    #[serde(alias = "maxBurst")]
    pub max_burst: u64,
    /// TTL of idle bucket state.
    #[serde(alias = "burstWindowMs")]
    pub burst_window_ms: u64,
}

impl BurstControlConfig {
    pub fn validate(&self) -> QuotaResult<()> {
        if !(self.recovery_rate > 0.0) || !self.recovery_rate.is_finite() {
            return Err(QuotaError::Config(format!(
                "recovery_rate ({}) must be a positive number",
                self.recovery_rate
            )));
        }
        if self.bucket_size < 1 {
            return Err(QuotaError::Config("bucket_size must be at least 1".into()));
        }
        if self.burst_window_ms > MAX_WINDOW_MS {
            return Err(QuotaError::Config(format!(
                "burst_window_ms ({}) must be at most {}",
                self.burst_window_ms, MAX_WINDOW_MS
            )));
        }
        if self.burst_window_ms == 0 {
            return Err(QuotaError::Config(
                "burst_window_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// Default value helpers
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_true() -> bool {
    true
}
fn default_weight() -> u32 {
    1
}
fn default_path_prefix() -> String {
    "/".to_string()
}
fn default_max_body_bytes() -> usize {
    1_048_576
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Redis
}
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_timeout_ms() -> u64 {
    250
}
fn default_store_connect_timeout_ms() -> u64 {
    1000
}
fn default_failure_mode() -> FailureMode {
    FailureMode::Open
}
fn default_unknown_identity() -> UnknownIdentityPolicy {
    UnknownIdentityPolicy::Shared
}
fn default_simulation_max_requests() -> u32 {
    1000
}
fn default_simulation_delay_ms() -> u64 {
    10
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        for route in &self.routes {
            let upstream_exists = self.upstreams.iter().any(|u| u.name == route.upstream);
            if !upstream_exists {
                anyhow::bail!(
                    "route references unknown upstream '{}' (host={:?}, path={})",
                    route.upstream,
                    route.host,
                    route.path_prefix
                );
            }
        }

        for upstream in &self.upstreams {
            if upstream.servers.is_empty() {
                anyhow::bail!("upstream '{}' has no servers", upstream.name);
            }
        }

        if self.store.backend == StoreBackend::Redis && self.store.url.trim().is_empty() {
            anyhow::bail!("store.url is required for the redis backend");
        }
        if self.store.timeout_ms == 0 {
            anyhow::bail!("store.timeout_ms must be greater than 0");
        }

        let settings = &self.rate_limit;
        if settings.simulation.max_requests == 0 {
            anyhow::bail!("rate_limit.simulation.max_requests must be at least 1");
        }

        for (operation_type, burst) in &settings.burst_controls {
            burst
                .validate()
                .map_err(|e| anyhow::anyhow!("burst control '{}': {}", operation_type, e))?;
        }

        for rule in &settings.rules {
            rule.validate()?;
            if let Some(ref op) = rule.operation_type {
                if !settings.burst_controls.contains_key(op) {
                    anyhow::bail!(
                        "rule '{}' references unknown operation_type '{}'",
                        rule.path_prefix,
                        op
                    );
                }
            }
        }

        for (shadowed, by) in shadowed_rules(&settings.rules) {
            tracing::warn!(
                rule = %settings.rules[shadowed].path_prefix,
                shadowed_by = %settings.rules[by].path_prefix,
                "rate limit rule is unreachable; declare more specific prefixes first"
            );
        }

        Ok(())
    }
}

/// Pairs of `(unreachable, earlier)` rule indices where the earlier rule
/// matches every request the later one would.
pub fn shadowed_rules(rules: &[RateLimitRule]) -> Vec<(usize, usize)> {
    let mut shadowed = Vec::new();
    for (j, later) in rules.iter().enumerate() {
        let by = rules[..j].iter().position(|earlier| {
            later.path_prefix.starts_with(&earlier.path_prefix)
                && match (&earlier.method, &later.method) {
                    (None, _) => true,
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    (Some(_), None) => false,
                }
        });
        if let Some(i) = by {
            shadowed.push((j, i));
        }
    }
    shadowed
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  listen: "127.0.0.1:8080"
upstreams:
  - name: api
    servers:
      - addr: "127.0.0.1:3000"
routes:
  - path_prefix: /api
    upstream: api
store:
  backend: memory
rate_limit:
  rules:
    - path_prefix: /api/publish/twitter
      scope: channel
      config:
        window_ms: 900000
        max_requests: 25
        burst_limit: 50
        burst_window_ms: 60000
    - path_prefix: /api/publish
      scope: organization
      operation_type: publish
      config:
        window_ms: 60000
        max_requests: 5
        burst_limit: 15
        burst_window_ms: 5000
  burst_controls:
    publish:
      bucket_size: 10
      recovery_rate: 1
      max_burst: 50
      burst_window_ms: 5000
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout_ms, 250);
        assert_eq!(config.rate_limit.failure_mode, FailureMode::Open);
        assert_eq!(
            config.rate_limit.unknown_identity,
            UnknownIdentityPolicy::Shared
        );
        assert_eq!(config.rate_limit.simulation.max_requests, 1000);
        assert_eq!(config.rate_limit.rules.len(), 2);
        assert_eq!(config.rate_limit.rules[1].scope, Scope::Organization);
        assert_eq!(
            config.rate_limit.rules[1].config.burst(),
            Some((15, 5000))
        );
        assert_eq!(config.rate_limit.burst_controls["publish"].bucket_size, 10);
    }

    #[test]
    fn burst_limit_requires_window() {
        let config = RateLimitConfig {
            window_ms: 60_000,
            max_requests: 5,
            burst_limit: Some(10),
            burst_window_ms: None,
        };
        assert!(matches!(config.validate(), Err(QuotaError::Config(_))));
    }

    #[test]
    fn burst_must_nest_inside_main_window() {
        let smaller_cap = RateLimitConfig::new(60_000, 10).with_burst(5, 1_000);
        assert!(smaller_cap.validate().is_err());

        let longer_window = RateLimitConfig::new(60_000, 10).with_burst(20, 120_000);
        assert!(longer_window.validate().is_err());

        let ok = RateLimitConfig::new(60_000, 10).with_burst(20, 10_000);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn windows_longer_than_the_cap_are_rejected() {
        let huge = RateLimitConfig::new(i64::MAX as u64, 3);
        assert!(matches!(huge.validate(), Err(QuotaError::Config(_))));
        assert!(RateLimitConfig::new(MAX_WINDOW_MS + 1, 3).validate().is_err());
        assert!(RateLimitConfig::new(MAX_WINDOW_MS, 3).validate().is_ok());

        let burst = BurstControlConfig {
            bucket_size: 10,
            recovery_rate: 1.0,
            max_burst: 50,
            burst_window_ms: u64::MAX,
        };
        assert!(burst.validate().is_err());
    }

    #[test]
    fn path_pattern_captures_named_segments() {
        let rule = RateLimitRule {
            path_prefix: "/api/channels".into(),
            method: None,
            scope: Scope::Channel,
            config: RateLimitConfig::new(60_000, 5),
            operation_type: None,
            path_pattern: Some("/api/channels/{channelId}/publish".into()),
        };

        let params = rule.path_params("/api/channels/c-7/publish/now");
        assert_eq!(params.get("channelId").map(String::as_str), Some("c-7"));
        assert!(rule.path_params("/api/channels/c-7/delete").is_empty());
        assert!(rule.path_params("/api/channels//publish").is_empty());
        assert!(rule.path_params("/api/channels").is_empty());

        let no_pattern = RateLimitRule {
            path_pattern: None,
            ..rule.clone()
        };
        assert!(no_pattern.path_params("/api/channels/c-7/publish").is_empty());

        let bad = RateLimitRule {
            path_pattern: Some("api/{}/x".into()),
            ..rule
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn burst_control_requires_positive_rate() {
        let burst = BurstControlConfig {
            bucket_size: 10,
            recovery_rate: 0.0,
            max_burst: 50,
            burst_window_ms: 5_000,
        };
        assert!(burst.validate().is_err());

        let burst = BurstControlConfig {
            recovery_rate: 2.0,
            bucket_size: 0,
            ..burst
        };
        assert!(burst.validate().is_err());
    }

    #[test]
    fn rejects_unknown_operation_type() {
        let yaml = SAMPLE.replace("operation_type: publish", "operation_type: generate");
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown operation_type"));
    }

    #[test]
    fn rejects_route_with_unknown_upstream() {
        let yaml = SAMPLE.replace("upstream: api", "upstream: missing");
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn detects_shadowed_rules() {
        let general = RateLimitRule {
            path_prefix: "/api/publish".into(),
            method: None,
            scope: Scope::Organization,
            config: RateLimitConfig::new(60_000, 5),
            operation_type: None,
            path_pattern: None,
        };
        let specific = RateLimitRule {
            path_prefix: "/api/publish/twitter".into(),
            scope: Scope::Channel,
            ..general.clone()
        };

        assert!(shadowed_rules(&[specific.clone(), general.clone()]).is_empty());
        assert_eq!(shadowed_rules(&[general, specific]), vec![(1, 0)]);
    }

    #[test]
    fn rule_method_match_is_case_insensitive() {
        let rule = RateLimitRule {
            path_prefix: "/api/auth".into(),
            method: Some("post".into()),
            scope: Scope::User,
            config: RateLimitConfig::new(900_000, 5),
            operation_type: None,
            path_pattern: None,
        };
        assert!(rule.matches("/api/auth/login", "POST"));
        assert!(!rule.matches("/api/auth/login", "GET"));
        assert!(!rule.matches("/api/users", "POST"));
    }
}
