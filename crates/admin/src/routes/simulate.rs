use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quotaguard_common::{QuotaError, RateLimitConfig};
use serde::Deserialize;

use super::error_response;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub key: String,
    pub config: RateLimitConfig,
    pub requests: u32,
}

/// POST /api/rate-limits/simulate
///
/// Runs synthetic checks against an explicit key and config and returns
/// every outcome plus the allowed/blocked totals.
pub async fn simulate(
    State(state): State<SharedState>,
    Json(request): Json<SimulateRequest>,
) -> Response {
    if request.key.trim().is_empty() {
        return error_response(QuotaError::Validation("key must not be empty".into()));
    }

    match state
        .service
        .simulate(&request.key, &request.config, request.requests)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}
