//! Rate limiting middleware for axum.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use super::AppState;
use crate::throttle::{RateLimitDecision, RequestInfo};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Request extension carrying the id of an already authenticated user.
///
/// Inserted by whatever authentication layer runs before the limiter; read by
/// the `user_or_ip` key strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Extract the metadata the throttle needs from an axum request.
pub fn request_info(request: &Request, trust_proxy_headers: bool) -> RequestInfo {
    let forwarded = trust_proxy_headers
        .then(|| forwarded_for(request.headers()))
        .flatten();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    let headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    RequestInfo {
        method: request.method().as_str().to_string(),
        path: request.uri().path().to_string(),
        ip: forwarded.or(peer),
        user_id: request
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone()),
        headers,
    }
}

/// First address in `X-Forwarded-For`, the original client.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
}

/// Apply the limiter governing the request path; reject with 429 when over.
///
/// Every response the limiter decided on carries the `X-RateLimit-*` headers.
/// Requests matched by a skip predicate never reach the store and pass
/// through without them.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let info = request_info(&request, state.trust_proxy_headers);
    let decision = state.rules.check(&info);

    if decision.skipped {
        return next.run(request).await;
    }

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        debug!(path = %info.path, ip = %info.client_ip(), "Rejecting request with 429");
        too_many_requests(&decision)
    };

    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn too_many_requests(decision: &RateLimitDecision) -> Response {
    let body = Json(json!({
        "success": false,
        "message": "Too many requests, please try again later.",
        "code": "TOO_MANY_REQUESTS",
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    if let Some(retry_after) = decision.retry_after_secs() {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}

/// Write the `X-RateLimit-*` headers; the reset is absolute Unix seconds.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let now_secs = chrono::Utc::now().timestamp().max(0) as u64;
    let reset_at = now_secs + decision.reset_ms.div_ceil(1000);

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
}
