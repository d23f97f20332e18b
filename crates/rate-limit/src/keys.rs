//! Request identity and counter key layout.
//!
//! Sliding-window keys look like
//! `rate_limit:<scope>:<path_prefix>[:org:<org>[:channel:<channel>]|:user:<user>]`
//! and are stored with a `:main` or `:burst` suffix. Token buckets live under
//! `burst:<operation_type>:org:<org>[:channel:<channel>]`.

use std::collections::HashMap;

use quotaguard_common::{RateLimitRule, Scope};

pub const KEY_PREFIX: &str = "rate_limit";
pub const BUCKET_PREFIX: &str = "burst";
/// Placeholder for an identity dimension that could not be resolved.
pub const UNKNOWN: &str = "unknown";

const MAIN_SUFFIX: &str = ":main";
const BURST_SUFFIX: &str = ":burst";

/// The authenticated caller, when an upstream auth layer provides one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub organization_id: Option<String>,
}

/// Everything key generation may look at for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: Option<AuthenticatedUser>,
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub client_ip: Option<String>,
}

impl RequestContext {
    pub fn with_user(mut self, user_id: &str, organization_id: Option<&str>) -> Self {
        self.user = Some(AuthenticatedUser {
            user_id: user_id.to_string(),
            organization_id: organization_id.map(str::to_string),
        });
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_path_param(mut self, name: &str, value: &str) -> Self {
        self.path_params.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn non_empty<'a>(value: Option<&'a String>) -> Option<&'a str> {
        value.map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Organization id: the authenticated user, then the `organizationId`
    /// query parameter, then the `x-organization-id` header.
    pub fn organization_id(&self) -> Option<String> {
        self.user
            .as_ref()
            .and_then(|u| u.organization_id.as_deref())
            .filter(|id| !id.is_empty())
            .or_else(|| Self::non_empty(self.query.get("organizationId")))
            .or_else(|| self.header("x-organization-id").filter(|v| !v.is_empty()))
            .map(str::to_string)
    }

    /// Channel id: the `channelId` path parameter, the `channelId` query
    /// parameter, the `channelId` body field, then the `x-channel-id` header.
    pub fn channel_id(&self) -> Option<String> {
        Self::non_empty(self.path_params.get("channelId"))
            .or_else(|| Self::non_empty(self.path_params.get("channel_id")))
            .or_else(|| Self::non_empty(self.query.get("channelId")))
            .map(str::to_string)
            .or_else(|| self.body_field("channelId"))
            .or_else(|| {
                self.header("x-channel-id")
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
    }

    /// User id: the authenticated user, the `userId` query parameter, the
    /// `x-user-id` header, then the client address.
    pub fn user_id(&self) -> Option<String> {
        self.user
            .as_ref()
            .map(|u| u.user_id.as_str())
            .filter(|id| !id.is_empty())
            .or_else(|| Self::non_empty(self.query.get("userId")))
            .or_else(|| self.header("x-user-id").filter(|v| !v.is_empty()))
            .or_else(|| Self::non_empty(self.client_ip.as_ref()))
            .map(str::to_string)
    }

    fn body_field(&self, name: &str) -> Option<String> {
        match self.body.as_ref()?.get(name)? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A counter key derived from a rule and a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    pub key: String,
    /// True when a dimension the scope needs fell back to [`UNKNOWN`].
    pub anonymous: bool,
}

/// Build the logical counter key for `rule` and the caller in `ctx`.
pub fn generate_key(rule: &RateLimitRule, ctx: &RequestContext) -> GeneratedKey {
    let base = base_key(rule.scope, &rule.path_prefix);
    let mut anonymous = false;
    let mut resolve = |value: Option<String>| {
        value.unwrap_or_else(|| {
            anonymous = true;
            UNKNOWN.to_string()
        })
    };

    let key = match rule.scope {
        Scope::Global => base,
        Scope::Organization => {
            let org = resolve(ctx.organization_id());
            format!("{}:org:{}", base, org)
        }
        Scope::Channel => {
            let org = resolve(ctx.organization_id());
            let channel = resolve(ctx.channel_id());
            format!("{}:org:{}:channel:{}", base, org, channel)
        }
        Scope::User => {
            let user = resolve(ctx.user_id());
            format!("{}:user:{}", base, user)
        }
    };

    GeneratedKey { key, anonymous }
}

pub fn base_key(scope: Scope, path_prefix: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, scope, path_prefix)
}

pub fn main_key(key: &str) -> String {
    format!("{}{}", key, MAIN_SUFFIX)
}

pub fn burst_key(key: &str) -> String {
    format!("{}{}", key, BURST_SUFFIX)
}

/// Key of the token bucket for `operation_type`, per organization and
/// optionally per channel.
pub fn bucket_key(operation_type: &str, organization_id: &str, channel_id: Option<&str>) -> String {
    match channel_id {
        Some(channel) => format!(
            "{}:{}:org:{}:channel:{}",
            BUCKET_PREFIX, operation_type, organization_id, channel
        ),
        None => format!("{}:{}:org:{}", BUCKET_PREFIX, operation_type, organization_id),
    }
}

pub fn tokens_key(key: &str) -> String {
    format!("{}:tokens", key)
}

pub fn last_refill_key(key: &str) -> String {
    format!("{}:last_refill", key)
}

/// Store pattern matching every window key of one organization.
pub fn organization_pattern(organization_id: &str) -> String {
    format!("{}:*:org:{}:*", KEY_PREFIX, organization_id)
}

/// Strip the `:main` / `:burst` suffix from a stored key.
pub fn logical_key(stored: &str) -> Option<&str> {
    stored
        .strip_suffix(MAIN_SUFFIX)
        .or_else(|| stored.strip_suffix(BURST_SUFFIX))
}

/// The scope and path prefix encoded in a logical key.
pub fn parse_key(key: &str) -> Option<(Scope, &str)> {
    let rest = key.strip_prefix(KEY_PREFIX)?.strip_prefix(':')?;
    let (scope, rest) = rest.split_once(':')?;
    let scope = match scope {
        "global" => Scope::Global,
        "organization" => Scope::Organization,
        "channel" => Scope::Channel,
        "user" => Scope::User,
        _ => return None,
    };
    let path = match scope {
        Scope::Global => rest,
        Scope::Organization => rest.rsplit_once(":org:")?.0,
        Scope::Channel => rest.rsplit_once(":channel:")?.0.rsplit_once(":org:")?.0,
        Scope::User => rest.rsplit_once(":user:")?.0,
    };
    Some((scope, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaguard_common::RateLimitConfig;

    fn rule(path: &str, scope: Scope) -> RateLimitRule {
        RateLimitRule {
            path_prefix: path.to_string(),
            method: None,
            scope,
            config: RateLimitConfig::new(60_000, 10),
            operation_type: None,
            path_pattern: None,
        }
    }

    #[test]
    fn organization_prefers_authenticated_user() {
        let ctx = RequestContext::default()
            .with_user("u1", Some("org-auth"))
            .with_query("organizationId", "org-query")
            .with_header("X-Organization-Id", "org-header");
        assert_eq!(ctx.organization_id().as_deref(), Some("org-auth"));

        let ctx = RequestContext::default()
            .with_query("organizationId", "org-query")
            .with_header("x-organization-id", "org-header");
        assert_eq!(ctx.organization_id().as_deref(), Some("org-query"));

        let ctx = RequestContext::default().with_header("X-Organization-Id", "org-header");
        assert_eq!(ctx.organization_id().as_deref(), Some("org-header"));
    }

    #[test]
    fn channel_resolution_order() {
        let ctx = RequestContext::default()
            .with_path_param("channelId", "ch-path")
            .with_query("channelId", "ch-query")
            .with_body(serde_json::json!({ "channelId": "ch-body" }))
            .with_header("x-channel-id", "ch-header");
        assert_eq!(ctx.channel_id().as_deref(), Some("ch-path"));

        let ctx = RequestContext::default()
            .with_body(serde_json::json!({ "channelId": 42 }))
            .with_header("x-channel-id", "ch-header");
        assert_eq!(ctx.channel_id().as_deref(), Some("42"));

        let ctx = RequestContext::default().with_header("x-channel-id", "ch-header");
        assert_eq!(ctx.channel_id().as_deref(), Some("ch-header"));
    }

    #[test]
    fn user_falls_back_to_client_ip() {
        let ctx = RequestContext::default().with_client_ip("10.0.0.1");
        assert_eq!(ctx.user_id().as_deref(), Some("10.0.0.1"));

        let ctx = RequestContext::default()
            .with_client_ip("10.0.0.1")
            .with_header("x-user-id", "u9");
        assert_eq!(ctx.user_id().as_deref(), Some("u9"));
    }

    #[test]
    fn generates_keys_per_scope() {
        let ctx = RequestContext::default()
            .with_user("u1", Some("o1"))
            .with_query("channelId", "c1");

        assert_eq!(
            generate_key(&rule("/api/ping", Scope::Global), &ctx).key,
            "rate_limit:global:/api/ping"
        );
        assert_eq!(
            generate_key(&rule("/api/generate", Scope::Organization), &ctx).key,
            "rate_limit:organization:/api/generate:org:o1"
        );
        assert_eq!(
            generate_key(&rule("/api/publish/twitter", Scope::Channel), &ctx).key,
            "rate_limit:channel:/api/publish/twitter:org:o1:channel:c1"
        );
        assert_eq!(
            generate_key(&rule("/api/auth", Scope::User), &ctx).key,
            "rate_limit:user:/api/auth:user:u1"
        );
    }

    #[test]
    fn missing_dimensions_become_unknown() {
        let generated = generate_key(
            &rule("/api/publish", Scope::Channel),
            &RequestContext::default(),
        );
        assert_eq!(
            generated.key,
            "rate_limit:channel:/api/publish:org:unknown:channel:unknown"
        );
        assert!(generated.anonymous);

        let generated = generate_key(
            &rule("/api/ping", Scope::Global),
            &RequestContext::default(),
        );
        assert!(!generated.anonymous);
    }

    #[test]
    fn bucket_keys() {
        assert_eq!(bucket_key("publish", "o1", None), "burst:publish:org:o1");
        assert_eq!(
            bucket_key("publish", "o1", Some("c1")),
            "burst:publish:org:o1:channel:c1"
        );
        assert_eq!(tokens_key("burst:publish:org:o1"), "burst:publish:org:o1:tokens");
    }

    #[test]
    fn parses_logical_keys() {
        assert_eq!(
            logical_key("rate_limit:organization:/api/a:org:o1:main"),
            Some("rate_limit:organization:/api/a:org:o1")
        );
        assert_eq!(logical_key("burst:publish:org:o1:tokens"), None);

        assert_eq!(
            parse_key("rate_limit:organization:/api/a:org:o1"),
            Some((Scope::Organization, "/api/a"))
        );
        assert_eq!(
            parse_key("rate_limit:channel:/api/p:org:o1:channel:c1"),
            Some((Scope::Channel, "/api/p"))
        );
        assert_eq!(
            parse_key("rate_limit:user:/api/auth:user:1.2.3.4"),
            Some((Scope::User, "/api/auth"))
        );
        assert_eq!(parse_key("rate_limit:global:/x"), Some((Scope::Global, "/x")));
        assert_eq!(parse_key("burst:publish:org:o1"), None);
    }
}
