use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, RawPathParams, Request};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, RequestExt};
use quotaguard_common::{RateLimitRule, Scope};
use quotaguard_rate_limit::{AuthenticatedUser, RequestContext};
use serde_json::json;

/// Collect everything key generation may need from an inbound request.
///
/// Path parameters come from the router when the request hit a templated
/// route, and from the matched rule's `path_pattern` otherwise. The body is
/// only read for channel-scoped rules, whose channel id may travel in a JSON
/// body. A body over `max_body_bytes` is rejected with 413 since it can no
/// longer be forwarded intact.
pub async fn extract(
    mut request: Request,
    rule: Option<&RateLimitRule>,
    max_body_bytes: usize,
) -> Result<(Request, RequestContext), Response> {
    let mut path_params: HashMap<String, String> = rule
        .map(|rule| rule.path_params(request.uri().path()))
        .unwrap_or_default();
    if let Ok(params) = request.extract_parts::<RawPathParams>().await {
        path_params.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    }
    let needs_body = rule.is_some_and(|rule| rule.scope == Scope::Channel);

    let query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();

    let headers: HashMap<String, String> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let ctx = RequestContext {
        user: request.extensions().get::<AuthenticatedUser>().cloned(),
        path_params,
        query,
        headers,
        body: None,
        client_ip: Some(client_ip(&request)),
    };

    if !needs_body || !is_json(&request) {
        return Ok((request, ctx));
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, limit = max_body_bytes, "request body rejected");
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({
                    "status": "error",
                    "message": format!("request body exceeds {} bytes", max_body_bytes)
                })),
            )
                .into_response());
        }
    };

    let ctx = RequestContext {
        body: serde_json::from_slice(&bytes).ok(),
        ..ctx
    };
    Ok((Request::from_parts(parts, Body::from(bytes)), ctx))
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim().to_string())
        })
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| quotaguard_rate_limit::keys::UNKNOWN.to_string())
}

fn is_json(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json") || ct.contains("+json"))
}
