mod admission;
mod config;
mod context;
mod service;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use quotaguard_admin::{new_shared_state, run_admin_server};
use quotaguard_rate_limit::{build_store, RateLimitService};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::GatewayConfig;
use crate::service::{build_gateway_router, QuotaProxy};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    // Parse command-line args for config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/quotaguard.yaml".to_string());

    info!(config_path = %config_path, "starting quotaguard");

    let gateway_config = GatewayConfig::load(&config_path)?;
    let app_config = gateway_config.config.clone();

    let store = build_store(&app_config.store)?;
    if let Err(e) = store.ping().await {
        warn!(
            error = %e,
            failure_mode = ?app_config.rate_limit.failure_mode,
            "counter store not reachable at startup"
        );
    }

    let service = RateLimitService::new(store, &app_config.rate_limit);
    let state = new_shared_state(app_config.clone(), service);
    let proxy = Arc::new(QuotaProxy::new(state.clone())?);
    let router = build_gateway_router(proxy);

    let listener = tokio::net::TcpListener::bind(&app_config.server.listen).await?;
    info!(
        addr = %app_config.server.listen,
        config = %gateway_config.config_path.display(),
        "gateway listening"
    );
    let gateway = async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(anyhow::Error::from)
    };

    if app_config.server.admin.enabled {
        let admin = run_admin_server(state, &app_config.server.admin.listen);
        tokio::select! {
            res = gateway => res?,
            res = admin => res?,
            _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        }
    } else {
        tokio::select! {
            res = gateway => res?,
            _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        }
    }

    info!("quotaguard stopped");
    Ok(())
}
