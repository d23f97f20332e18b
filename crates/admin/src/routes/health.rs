use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/health
///
/// Reports uptime and whether the counter store answers a ping. A store
/// outage leaves the service "degraded" rather than down, since admission
/// keeps running under the configured failure mode.
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();

    let (status, store) = match state.service.ping().await {
        Ok(()) => ("healthy", json!({ "status": "up" })),
        Err(e) => {
            tracing::warn!(error = %e, "counter store health check failed");
            ("degraded", json!({ "status": "down", "error": e.to_string() }))
        }
    };

    Json(json!({
        "status": status,
        "store": store,
        "uptime_secs": uptime,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
