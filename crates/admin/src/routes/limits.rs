use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quotaguard_rate_limit::{QuotaHealth, RateLimitStats, RateLimitStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error_response;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub path: Option<String>,
    pub method: Option<String>,
    #[serde(alias = "channelId")]
    pub channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    #[serde(alias = "channelId")]
    pub channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    pub path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse<'a> {
    organization_id: &'a str,
    path: &'a str,
    method: &'a str,
    #[serde(flatten)]
    status: RateLimitStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse<'a> {
    organization_id: &'a str,
    #[serde(flatten)]
    stats: RateLimitStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse<'a> {
    organization_id: &'a str,
    #[serde(flatten)]
    health: QuotaHealth,
}

/// GET /api/rate-limits/status/{organization_id}?path=&method=&channel_id=
///
/// Read-only usage of the key the organization would hit on `path`. The
/// method defaults to POST.
pub async fn get_status(
    State(state): State<SharedState>,
    Path(organization_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(path) = query.path.as_deref().filter(|p| !p.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "path query parameter is required"
            })),
        )
            .into_response();
    };
    let method = query.method.as_deref().unwrap_or("POST");

    match state
        .service
        .organization_status(&organization_id, path, method, query.channel_id.as_deref())
        .await
    {
        Ok(status) => Json(StatusResponse {
            organization_id: &organization_id,
            path,
            method,
            status,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/rate-limits/stats/{organization_id}
pub async fn get_stats(
    State(state): State<SharedState>,
    Path(organization_id): Path<String>,
) -> Response {
    match state.service.stats(&organization_id).await {
        Ok(stats) => Json(StatsResponse {
            organization_id: &organization_id,
            stats,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/rate-limits/health/{organization_id}
pub async fn get_health(
    State(state): State<SharedState>,
    Path(organization_id): Path<String>,
) -> Response {
    match state.service.health(&organization_id).await {
        Ok(health) => Json(HealthResponse {
            organization_id: &organization_id,
            health,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/rate-limits/burst/{organization_id}/{operation_type}?channel_id=
pub async fn get_burst_status(
    State(state): State<SharedState>,
    Path((organization_id, operation_type)): Path<(String, String)>,
    Query(query): Query<ChannelQuery>,
) -> Response {
    match state
        .service
        .burst_status(&operation_type, &organization_id, query.channel_id.as_deref())
        .await
    {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/rate-limits/reset/{organization_id}?path=
///
/// Deletes both windows of every key of the organization, or only of keys
/// containing `path`.
pub async fn reset_limits(
    State(state): State<SharedState>,
    Path(organization_id): Path<String>,
    Query(query): Query<ResetQuery>,
) -> Response {
    let filter = query.path.as_deref().filter(|p| !p.is_empty());
    match state.service.reset_organization(&organization_id, filter).await {
        Ok(reset_keys) => Json(json!({
            "message": "Rate limits reset successfully",
            "resetKeys": reset_keys
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}
