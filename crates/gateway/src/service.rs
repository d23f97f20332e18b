use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{middleware, Json, Router};
use quotaguard_admin::state::SharedState;
use quotaguard_common::RouteConfig;
use serde_json::json;
use tracing::{debug, error, info};

use crate::admission::admission_middleware;
use crate::context::client_ip;
use crate::upstream::UpstreamSelector;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers that describe a single hop and are not forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Forwards admitted requests to the upstream chosen by the route table.
pub struct QuotaProxy {
    pub state: SharedState,
    routes: Vec<RouteConfig>,
    upstreams: Vec<UpstreamSelector>,
    client: reqwest::Client,
}

impl QuotaProxy {
    pub fn new(state: SharedState) -> anyhow::Result<Self> {
        let upstreams: Vec<UpstreamSelector> = state
            .config
            .upstreams
            .iter()
            .map(UpstreamSelector::from_config)
            .collect();
        let routes = state.config.routes.clone();
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        info!(
            routes = routes.len(),
            upstreams = upstreams.len(),
            "upstream routing configured"
        );
        Ok(Self {
            state,
            routes,
            upstreams,
            client,
        })
    }

    fn find_route(&self, host: Option<&str>, path: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|route| {
            let host_match = match (&route.host, host) {
                (Some(route_host), Some(req_host)) => req_host == route_host.as_str(),
                (Some(_), None) => false,
                (None, _) => true,
            };
            host_match && path.starts_with(&route.path_prefix)
        })
    }

    fn find_upstream(&self, name: &str) -> Option<&UpstreamSelector> {
        self.upstreams.iter().find(|u| u.name == name)
    }
}

/// The public router: admission control in front of upstream forwarding.
pub fn build_gateway_router(proxy: Arc<QuotaProxy>) -> Router {
    let state = proxy.state.clone();
    Router::new()
        .fallback(forward)
        .with_state(proxy)
        .layer(middleware::from_fn_with_state(state, admission_middleware))
}

async fn forward(State(proxy): State<Arc<QuotaProxy>>, request: Request) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string());
    let path = request.uri().path().to_string();

    let Some(route) = proxy.find_route(host.as_deref(), &path) else {
        debug!(path = %path, host = ?host, "no route for request");
        return error_body(StatusCode::NOT_FOUND, "no route for request");
    };
    let Some(base) = proxy
        .find_upstream(&route.upstream)
        .and_then(UpstreamSelector::select)
    else {
        proxy.state.metrics.upstream_errors.inc();
        error!(upstream = %route.upstream, "upstream has no servers");
        return error_body(StatusCode::BAD_GATEWAY, "no upstream server available");
    };

    let forwarded_for = client_ip(&request);
    let (parts, body) = request.into_parts();
    let max_body = proxy.state.config.server.max_body_bytes;
    let body = match axum::body::to_bytes(body, max_body).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_body(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("request body exceeds {} bytes", max_body),
            )
        }
    };

    let url = format!(
        "{}{}",
        base,
        parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    let mut headers = strip_hop_by_hop(&parts.headers);
    headers.remove(header::HOST);
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }

    let upstream_response = proxy
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream_response = match upstream_response {
        Ok(resp) => resp,
        Err(e) => {
            proxy.state.metrics.upstream_errors.inc();
            error!(error = %e, url = %url, "upstream request failed");
            return error_body(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    let status = upstream_response.status();
    let headers = strip_hop_by_hop(upstream_response.headers());
    match upstream_response.bytes().await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            proxy.state.metrics.upstream_errors.inc();
            error!(error = %e, url = %url, "failed to read upstream response");
            error_body(StatusCode::BAD_GATEWAY, "upstream response failed")
        }
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    out
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}
