//! Middleware for the public listener: sealed gate, rate limiting, browser
//! security headers, panic containment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::config::RateLimitSettings;
use crate::error::ServiceError;
use crate::AppState;

/// Peer address recorded per connection by the listeners.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// DER certificate chain presented by the TLS peer, leaf first.
#[derive(Debug, Clone, Default)]
pub struct PeerCerts(pub Arc<Vec<Vec<u8>>>);

/// Separate keyed buckets per listener group.
pub struct RateLimiters {
    service: DefaultKeyedRateLimiter<IpAddr>,
    browser: DefaultKeyedRateLimiter<IpAddr>,
}

impl RateLimiters {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let burst = NonZeroU32::new(settings.burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let service_rate =
            NonZeroU32::new(settings.service_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let browser_rate =
            NonZeroU32::new(settings.browser_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            service: RateLimiter::keyed(Quota::per_second(service_rate).allow_burst(burst)),
            browser: RateLimiter::keyed(Quota::per_second(browser_rate).allow_burst(burst)),
        }
    }
}

fn peer_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ClientAddr>()
        .map(|addr| addr.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Telemetry for every request: one span around the handler chain plus
/// throughput and server-error counters. The sink never blocks, so this
/// adds nothing to the request's critical path.
pub async fn request_telemetry(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let span_name = format!("{} {}", request.method(), request.uri().path());
    let span = state.telemetry.span_start(&span_name);

    let response = next.run(request).await;

    state.telemetry.record_metric("http.requests", 1.0);
    if response.status().is_server_error() {
        state.telemetry.record_metric("http.server_errors", 1.0);
    }
    state.telemetry.span_end(span);
    response
}

/// Reject business traffic while the barrier is sealed: 503 with the
/// closed-set `temporarily_unavailable` code and a sealed reason.
pub async fn seal_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.barrier.is_unsealed().await {
        return ServiceError::Sealed.into_response();
    }
    next.run(request).await
}

pub async fn service_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.limiters.service.check_key(&peer_ip(&request)).is_err() {
        return rate_limited();
    }
    next.run(request).await
}

pub async fn browser_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.limiters.browser.check_key(&peer_ip(&request)).is_err() {
        return rate_limited();
    }
    next.run(request).await
}

fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(serde_json::json!({
            "error": "temporarily_unavailable",
            "error_description": "rate limit exceeded"
        })),
    )
        .into_response()
}

/// Browser responses carry a restrictive CSP and frame denial; forms are
/// same-origin only.
pub async fn browser_security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'none'; style-src 'unsafe-inline'; form-action 'self'; frame-ancestors 'none'",
        ),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// Panic containment: programmer errors become an audited 500, never a
/// connection teardown.
pub fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic".to_string());
    tracing::error!(panic = %detail, "handler panicked");
    ServiceError::Internal("handler panicked".to_string()).into_response()
}
