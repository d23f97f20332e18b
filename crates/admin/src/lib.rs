pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use quotaguard_common::AppConfig;
use quotaguard_rate_limit::RateLimitService;
use tower_http::cors::{Any, CorsLayer};

use crate::state::SharedState;

pub use state::{AdmissionMetrics, AppState};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/api/health", get(routes::health::health_check))
        // Prometheus metrics
        .route("/api/metrics", get(routes::metrics::get_metrics))
        // Rule and burst-control tables
        .route("/api/rate-limits/config", get(routes::config::get_config))
        // Per-organization quota inspection
        .route(
            "/api/rate-limits/status/{organization_id}",
            get(routes::limits::get_status),
        )
        .route(
            "/api/rate-limits/stats/{organization_id}",
            get(routes::limits::get_stats),
        )
        .route(
            "/api/rate-limits/health/{organization_id}",
            get(routes::limits::get_health),
        )
        .route(
            "/api/rate-limits/burst/{organization_id}/{operation_type}",
            get(routes::limits::get_burst_status),
        )
        // Mutations
        .route(
            "/api/rate-limits/reset/{organization_id}",
            delete(routes::limits::reset_limits),
        )
        .route("/api/rate-limits/simulate", post(routes::simulate::simulate))
        // Attach shared state and middleware
        .with_state(state)
        .layer(cors)
}

/// Start the admin API server on the specified address.
///
/// This function will block until the server is shut down.
pub async fn run_admin_server(state: SharedState, listen_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Convenience function to create a SharedState from a config and the
/// admission service built from it.
pub fn new_shared_state(config: AppConfig, service: RateLimitService) -> SharedState {
    Arc::new(AppState::new(config, service))
}
