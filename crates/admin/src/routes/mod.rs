pub mod config;
pub mod health;
pub mod limits;
pub mod metrics;
pub mod simulate;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quotaguard_common::QuotaError;
use serde_json::json;

/// Map a service error to a JSON error response.
pub(crate) fn error_response(err: QuotaError) -> Response {
    let status = match &err {
        QuotaError::Validation(_) => StatusCode::BAD_REQUEST,
        QuotaError::UnknownOperationType(_) | QuotaError::NoMatchingRule { .. } => {
            StatusCode::NOT_FOUND
        }
        QuotaError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, status = status.as_u16(), "admin request failed");
    } else {
        tracing::debug!(error = %err, status = status.as_u16(), "admin request rejected");
    }

    (
        status,
        Json(json!({
            "status": "error",
            "message": err.to_string()
        })),
    )
        .into_response()
}
