//! Request middleware: request ids, request logging and admission control.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::ratelimit::{RateLimitKey, RateLimiter};

/// Header carrying the per-request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Machine-readable reason attached to rejected requests.
pub const REJECTION_REASON: &str = "too_many_requests";

/// Identifier assigned to each inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Tag every request with a fresh UUID, visible to later middleware and
/// echoed back in the `X-Request-ID` response header.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Settings for the request logger.
#[derive(Debug, Clone, Copy)]
pub struct RequestLoggerState {
    /// Requests slower than this are logged at warn level
    pub slow_request: Duration,
}

/// Emit one structured event per completed request.
pub async fn request_logger(
    State(state): State<RequestLoggerState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = peer_addr(&request)
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(request).await;

    let duration = started.elapsed();
    let status = response.status().as_u16();
    let duration_ms = duration.as_millis() as u64;

    if response.status().is_server_error() {
        error!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status,
            duration_ms = duration_ms,
            client_ip = %client_ip,
            user_agent = %user_agent,
            "request failed"
        );
    } else if duration > state.slow_request {
        warn!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status,
            duration_ms = duration_ms,
            client_ip = %client_ip,
            user_agent = %user_agent,
            "slow request"
        );
    } else {
        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status,
            duration_ms = duration_ms,
            client_ip = %client_ip,
            user_agent = %user_agent,
            "request completed"
        );
    }

    response
}

/// Limiter and rate descriptor applied to every request.
#[derive(Clone)]
pub struct AdmissionState {
    limiter: Arc<RateLimiter>,
    burst: u32,
    rate_per_second: f64,
}

impl AdmissionState {
    pub fn new(limiter: Arc<RateLimiter>, burst: u32, rate_per_second: f64) -> Self {
        Self {
            limiter,
            burst,
            rate_per_second,
        }
    }
}

/// Admit or reject each request by its caller address.
///
/// Every request gets exactly one limiter evaluation. Rejected requests are
/// answered with `429 Too Many Requests` and never reach the inner handler.
pub async fn admission(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let key = peer_addr(&request)
        .map(|addr| RateLimitKey::from_ip(addr.ip()))
        .unwrap_or_else(RateLimitKey::unknown_ip);

    let decision = state
        .limiter
        .allow(key.as_str(), state.burst, state.rate_per_second)
        .await;

    if decision.admitted {
        return next.run(request).await;
    }

    let retry_after = decision.retry_after_secs();
    debug!(
        key = %key,
        retry_after_secs = retry_after,
        "Rejecting request"
    );

    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(json!({
            "error": REJECTION_REASON,
            "message": "Rate limit exceeded",
            "retry_after": retry_after,
        })),
    )
        .into_response()
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}
