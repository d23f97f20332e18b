use anyhow::{Context, Result};
use quotaguard_common::AppConfig;
use std::path::PathBuf;
use tracing::info;

/// Configuration loaded at startup along with where it came from.
pub struct GatewayConfig {
    pub config: AppConfig,
    pub config_path: PathBuf,
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self> {
        info!(path = path, "loading configuration");
        let config = AppConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path))?;
        info!(
            rules = config.rate_limit.rules.len(),
            burst_controls = config.rate_limit.burst_controls.len(),
            backend = ?config.store.backend,
            "configuration loaded"
        );
        Ok(Self {
            config,
            config_path: PathBuf::from(path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_sample_configuration() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/quotaguard.yaml");
        let loaded = GatewayConfig::load(path).unwrap();
        assert!(!loaded.config.rate_limit.rules.is_empty());
        assert!(loaded.config_path.ends_with("quotaguard.yaml"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = GatewayConfig::load("/nonexistent/quotaguard.yaml").err().unwrap();
        assert!(err.to_string().contains("/nonexistent/quotaguard.yaml"));
    }
}
