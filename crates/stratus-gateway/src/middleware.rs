//! HTTP middleware for the gateway server

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use stratus_observability::correlation::{with_context, CorrelationContext};

use crate::coordinator::Coordinator;

/// Flatten an axum header map into the lowercased string map the
/// correlation layer works with
pub fn header_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Write a string map into HTTP response headers, skipping invalid values
pub fn apply_headers(target: &mut HeaderMap, source: &HashMap<String, String>) {
    for (name, value) in source {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
        {
            target.insert(name, value);
        }
    }
}

/// Caller identity for rate limiting: API token first, then forwarded
/// client address, then the transport address
pub fn extract_caller(headers: &HeaderMap) -> String {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return format!("token:{token}");
        }
    }
    format!("ip:{}", extract_client_ip(headers))
}

/// Best-effort client address from proxy headers
pub fn extract_client_ip(headers: &HeaderMap) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse() {
            return ip;
        }
    }
    IpAddr::from([127, 0, 0, 1])
}

/// Open a correlation context for the request, run the rest of the stack
/// inside it, and echo the correlation headers on the response
pub async fn correlation_middleware(
    State(coordinator): State<Arc<Coordinator>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut ctx = CorrelationContext::extract(&header_hashmap(request.headers()));
    ctx.client_ip = Some(extract_client_ip(request.headers()).to_string());
    coordinator.correlation.store(ctx.clone());

    let mut response = with_context(ctx.clone(), next.run(request)).await;

    let mut headers = HashMap::new();
    ctx.inject(&mut headers);
    apply_headers(response.headers_mut(), &headers);
    response
}

/// Request timing and counters
pub async fn metrics_middleware(
    State(coordinator): State<Arc<Coordinator>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    info!(
        method = %method,
        path = %path,
        status,
        duration_ms = elapsed.as_millis() as u64,
        "http request completed"
    );
    let status_label = status.to_string();
    coordinator.collector.incr_counter(
        "stratus_http_requests_total",
        &[("status", status_label.as_str())],
        1.0,
    );
    coordinator.anomaly.record(
        "http_request_latency_ms",
        elapsed.as_secs_f64() * 1000.0,
        None,
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_prefers_bearer_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(extract_caller(&headers), "token:abc123");
    }

    #[test]
    fn caller_falls_back_to_forwarded_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(extract_caller(&headers), "ip:203.0.113.9");
    }

    #[test]
    fn client_ip_defaults_to_loopback() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), IpAddr::from([127, 0, 0, 1]));
    }

    #[test]
    fn header_maps_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Correlation-ID", HeaderValue::from_static("corr_1"));
        let map = header_hashmap(&headers);
        assert_eq!(map.get("x-correlation-id").map(String::as_str), Some("corr_1"));

        let mut out = HeaderMap::new();
        apply_headers(&mut out, &map);
        assert_eq!(out.get("x-correlation-id").unwrap(), "corr_1");
    }
}
