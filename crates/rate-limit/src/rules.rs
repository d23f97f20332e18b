use quotaguard_common::{RateLimitRule, Scope};

/// Ordered rule table. The first rule whose prefix and method match wins,
/// so more specific prefixes must be declared before general ones.
#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    rules: Vec<RateLimitRule>,
}

impl RuleMatcher {
    pub fn new(rules: Vec<RateLimitRule>) -> Self {
        Self { rules }
    }

    pub fn find(&self, path: &str, method: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|rule| rule.matches(path, method))
    }

    /// The rule that owns keys built from `scope` and `path_prefix`.
    pub fn find_by_key(&self, scope: Scope, path_prefix: &str) -> Option<&RateLimitRule> {
        self.rules
            .iter()
            .find(|rule| rule.scope == scope && rule.path_prefix == path_prefix)
    }

    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
