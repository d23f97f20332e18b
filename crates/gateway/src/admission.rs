use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use quotaguard_admin::state::SharedState;
use quotaguard_rate_limit::{Admission, RateLimitResult, RejectionBody};
use tracing::{debug, warn};

use crate::context;

/// Admission control for every proxied request.
///
/// Requests no rule covers pass through untouched. Admitted requests are
/// forwarded and the response carries the quota headers. Rejected requests
/// never reach the upstream and get a 429. A failed check lets the request
/// through unlimited.
pub async fn admission_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let metrics = &state.metrics;
    metrics.requests_total.inc();
    let started = Instant::now();

    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();
    let rule = state.service.find_rule(&path, &method);

    let (request, ctx) =
        match context::extract(request, rule, state.config.server.max_body_bytes).await {
            Ok(extracted) => extracted,
            Err(response) => return response,
        };

    let admission = state.service.evaluate(&path, &method, &ctx).await;
    metrics
        .decision_duration
        .observe(started.elapsed().as_secs_f64());

    match admission {
        Ok(Admission::Unmatched) => {
            metrics.unmatched_total.inc();
            next.run(request).await
        }
        Ok(Admission::Admitted { scope, key, result }) => {
            if result.degraded {
                metrics.degraded_total.inc();
            }
            metrics
                .admitted_total
                .with_label_values(&[scope.as_str()])
                .inc();
            debug!(key = %key, remaining = result.remaining, "request admitted");

            let mut response = next.run(request).await;
            set_quota_headers(response.headers_mut(), &result);
            response
        }
        Ok(Admission::Rejected { scope, key, result }) => {
            if result.degraded {
                metrics.degraded_total.inc();
            }
            metrics
                .rejected_total
                .with_label_values(&[scope.as_str()])
                .inc();
            warn!(
                key = %key,
                path = %path,
                method = %method,
                current = result.current,
                limit = result.limit,
                "rate limit exceeded"
            );
            rejection_response(&result)
        }
        Err(e) => {
            metrics.errors_total.inc();
            warn!(error = %e, path = %path, "admission check failed, forwarding unlimited");
            next.run(request).await
        }
    }
}

/// `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
fn set_quota_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(result.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(result.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(result.reset));
}

fn rejection_response(result: &RateLimitResult) -> Response {
    let retry_after = result.retry_after.unwrap_or(1).max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RejectionBody::new(retry_after)),
    )
        .into_response();
    let headers = response.headers_mut();
    set_quota_headers(headers, result);
    headers.insert("retry-after", HeaderValue::from(retry_after));
    response
}
