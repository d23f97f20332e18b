use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/rate-limits/config
///
/// Returns the rule table, the burst-control table and the active policies.
pub async fn get_config(State(state): State<SharedState>) -> Json<Value> {
    let settings = &state.config.rate_limit;

    Json(json!({
        "enabled": state.service.is_enabled(),
        "failureMode": settings.failure_mode,
        "unknownIdentity": settings.unknown_identity,
        "rules": state.service.rules(),
        "burstControls": state.service.burst_controls(),
        "simulation": {
            "maxRequests": state.service.simulation().max_requests,
            "delayMs": state.service.simulation().delay_ms
        }
    }))
}
