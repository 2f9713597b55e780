//! HTTP handlers: traffic entry point, observability surface and admin ops

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use stratus_cache::InvalidationScope;
use stratus_common::Error;
use stratus_observability::AnomalySeverity;
use stratus_routing::ConsistencyLevel;

use crate::coordinator::{Coordinator, TargetKind, TrafficOutcome, TrafficRequest};
use crate::middleware::{apply_headers, extract_caller, extract_client_ip, header_hashmap};

/// Application state shared by every handler
pub type AppState = Arc<Coordinator>;

/// Build the full route table
pub fn create_router(coordinator: AppState) -> Router {
    Router::new()
        // traffic entry
        .route("/proxy/*path", axum::routing::any(proxy))
        // health surface
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        // observability surface
        .route("/v1/observability/breakers", get(breaker_status))
        .route("/v1/observability/rate-limit", get(rate_limit_stats))
        .route("/v1/observability/replicas", get(replica_health))
        .route("/v1/observability/cache", get(cache_metrics))
        .route("/v1/observability/balancer", get(balancer_metrics))
        .route("/v1/observability/alerts", get(recent_alerts))
        .route("/v1/observability/correlation/:id", get(correlation_chain))
        .route("/v1/observability/trace/:trace_id", get(trace_lookup))
        .route("/v1/observability/consensus", get(consensus_history))
        .route("/v1/observability/profiles", get(operation_profiles))
        .route("/v1/observability/metrics/:name/summary", get(metric_summary))
        .route("/metrics", get(prometheus_metrics))
        // consensus rounds
        .route("/v1/consensus", post(start_consensus))
        .route("/v1/consensus/:id/votes", post(cast_vote))
        .route("/v1/consensus/:id", get(consensus_result))
        // mutating admin surface, token-gated
        .route("/admin/breakers/:name/reset", post(reset_breaker))
        .route("/admin/cache/flush", post(flush_cache))
        .route("/admin/cache/warm", post(warm_cache))
        .route("/admin/failover/:region", post(trigger_failover))
        .with_state(coordinator)
}

/// Traffic entry point: wraps the coordinator pipeline
async fn proxy(
    State(coordinator): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    method: axum::http::Method,
    headers: HeaderMap,
) -> Response {
    let header_map = header_hashmap(&headers);
    let is_read = method == axum::http::Method::GET || method == axum::http::Method::HEAD;
    let target = if is_read {
        TargetKind::CacheableGet
    } else if header_map.contains_key("x-database-write") {
        TargetKind::Database { consistency: ConsistencyLevel::Strong, write: true }
    } else {
        TargetKind::Region
    };

    let request = TrafficRequest {
        caller: extract_caller(&headers),
        client_ip: extract_client_ip(&headers),
        method: method.to_string(),
        path: format!("/{path}"),
        query: query.unwrap_or_default(),
        headers: header_map,
        target,
    };
    let if_none_match = headers.get("if-none-match").and_then(|v| v.to_str().ok()).map(String::from);

    match coordinator.process(request).await {
        Ok(outcome) => render_outcome(outcome, if_none_match),
        Err(error) => render_error(&error),
    }
}

fn render_outcome(outcome: TrafficOutcome, if_none_match: Option<String>) -> Response {
    let mut headers = HeaderMap::new();
    apply_headers(&mut headers, &outcome.headers);

    if let Some(cache_status) = outcome.cache_status {
        headers.insert("x-cache", axum::http::HeaderValue::from_static(cache_status));
    }
    if let Some(age) = outcome.age_seconds {
        if let Ok(value) = age.to_string().parse() {
            headers.insert("age", value);
        }
    }
    if let Some(etag) = &outcome.etag {
        if let Ok(value) = etag.parse() {
            headers.insert("etag", value);
        }
        if if_none_match.as_deref() == Some(etag.as_str()) {
            return (StatusCode::NOT_MODIFIED, headers).into_response();
        }
    }
    if outcome.degraded {
        headers.insert("x-degraded", axum::http::HeaderValue::from_static("true"));
    }
    if let Some(content_type) = &outcome.content_type {
        if let Ok(value) = content_type.parse() {
            headers.insert("content-type", value);
        }
    }

    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK);
    match outcome.body {
        Some(body) => (status, headers, body).into_response(),
        None => (status, headers, Json(serde_json::json!({ "endpoint": outcome.endpoint })))
            .into_response(),
    }
}

fn render_error(error: &Error) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    if let Some(retry_after) = error.retry_after_secs() {
        if let Ok(value) = retry_after.to_string().parse() {
            headers.insert("retry-after", value);
        }
    }
    (
        status,
        headers,
        Json(serde_json::json!({
            "error": {
                "category": error.category(),
                "message": error.to_string(),
            }
        })),
    )
        .into_response()
}

async fn health(State(coordinator): State<AppState>) -> Response {
    let status = coordinator.health.check(&coordinator).await;
    let code = StatusCode::from_u16(status.overall.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        code,
        Json(serde_json::json!({
            "status": status.overall.as_str(),
            "message": status.message,
            "uptime_seconds": status.uptime_seconds,
            "timestamp": status.last_check,
        })),
    )
        .into_response()
}

async fn health_detailed(State(coordinator): State<AppState>) -> Response {
    let status = coordinator.health.check(&coordinator).await;
    let code = StatusCode::from_u16(status.overall.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(status)).into_response()
}

async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness gates on the critical components only
async fn readiness(State(coordinator): State<AppState>) -> Response {
    let status = coordinator.health.check(&coordinator).await;
    let critical = ["database_replicas", "global_load_balancer"];
    for name in critical {
        if let Some(component) = status.components.get(name) {
            if component.status.http_status() >= 500 {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "status": "not_ready", "component": name })),
                )
                    .into_response();
            }
        }
    }
    Json(serde_json::json!({ "status": "ready" })).into_response()
}

async fn breaker_status(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "breakers": coordinator.breakers.statuses(),
        "timestamp": Utc::now(),
    }))
}

async fn rate_limit_stats(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "stats": coordinator.limiter.stats(),
        "timestamp": Utc::now(),
    }))
}

async fn replica_health(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "primary_healthy": coordinator.replicas.primary_healthy(),
        "replicas": coordinator.replicas.replica_health(),
        "metrics": coordinator.replicas.metrics(),
        "timestamp": Utc::now(),
    }))
}

async fn cache_metrics(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "tiers": coordinator.cache.metrics(),
        "timestamp": Utc::now(),
    }))
}

async fn balancer_metrics(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "metrics": coordinator.balancer.metrics(),
        "endpoints": coordinator.balancer.endpoint_health(),
        "timestamp": Utc::now(),
    }))
}

#[derive(Deserialize)]
struct AlertsQuery {
    since: Option<DateTime<Utc>>,
    severity: Option<AnomalySeverity>,
    #[serde(default = "default_alert_limit")]
    limit: usize,
}

fn default_alert_limit() -> usize {
    50
}

async fn recent_alerts(
    State(coordinator): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    let alerts = coordinator.anomaly.alerts(query.since, query.severity, query.limit);
    let count = alerts.len();
    Json(serde_json::json!({ "alerts": alerts, "count": count }))
}

async fn correlation_chain(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let chain = coordinator.correlation.chain(&id);
    if chain.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown correlation id" })),
        )
            .into_response();
    }
    Json(serde_json::json!({ "chain": chain, "length": chain.len() })).into_response()
}

async fn trace_lookup(
    State(coordinator): State<AppState>,
    Path(trace_id): Path<String>,
) -> impl IntoResponse {
    let contexts = coordinator.correlation.for_trace(&trace_id);
    Json(serde_json::json!({ "trace_id": trace_id, "contexts": contexts }))
}

async fn consensus_history(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "active": coordinator.consensus.active_count(),
        "completed": coordinator.consensus.history(50),
    }))
}

async fn operation_profiles(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "profiles": coordinator.profiles.snapshot() }))
}

#[derive(Deserialize)]
struct SummaryQuery {
    #[serde(default = "default_summary_window")]
    window_seconds: f64,
}

fn default_summary_window() -> f64 {
    300.0
}

async fn metric_summary(
    State(coordinator): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> Response {
    match coordinator.anomaly.summary(&name, query.window_seconds) {
        Some(summary) => {
            Json(serde_json::json!({ "metric": name, "summary": summary })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no data for metric '{name}'") })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct StartConsensusRequest {
    subject: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn start_consensus(
    State(coordinator): State<AppState>,
    Json(body): Json<StartConsensusRequest>,
) -> impl IntoResponse {
    let id = coordinator.consensus.start(body.subject, body.tags);
    (StatusCode::CREATED, Json(serde_json::json!({ "consensus_id": id })))
}

#[derive(Deserialize)]
struct CastVoteRequest {
    voter_id: String,
    value: stratus_consensus::VoteValue,
    confidence: f64,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    expertise: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

async fn cast_vote(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CastVoteRequest>,
) -> Response {
    let mut vote = stratus_consensus::Vote::new(body.voter_id, body.value, body.confidence)
        .with_expertise(body.expertise)
        .with_reasoning(body.reasoning);
    if let Some(weight) = body.weight {
        vote = vote.with_weight(weight);
    }
    match coordinator.consensus.vote(&id, vote) {
        Ok(()) => Json(serde_json::json!({ "status": "recorded" })).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn consensus_result(
    State(coordinator): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match coordinator.consensus.result(&id) {
        Ok(result) => Json(result).into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "pending", "detail": e.to_string() })),
        )
            .into_response(),
    }
}

/// Prometheus text exposition of every component's counters
async fn prometheus_metrics(State(coordinator): State<AppState>) -> Response {
    let mut output = String::new();

    output.push_str(&format!(
        "stratus_gateway_uptime_seconds {}\n",
        coordinator.uptime_seconds()
    ));
    output.push_str(&format!(
        "stratus_gateway_active_requests {}\n",
        coordinator.active_requests()
    ));

    for (series, value) in coordinator.collector.snapshot() {
        output.push_str(&format!("{series} {value}\n"));
    }

    for (tier, metrics) in coordinator.cache.metrics() {
        output.push_str(&format!("stratus_cache_hits{{tier=\"{tier}\"}} {}\n", metrics.hits));
        output.push_str(&format!("stratus_cache_misses{{tier=\"{tier}\"}} {}\n", metrics.misses));
        output.push_str(&format!(
            "stratus_cache_hit_rate{{tier=\"{tier}\"}} {:.2}\n",
            metrics.hit_rate
        ));
        output.push_str(&format!(
            "stratus_cache_bytes_served{{tier=\"{tier}\"}} {}\n",
            metrics.bytes_served
        ));
    }

    let limiter = coordinator.limiter.stats();
    output.push_str(&format!("stratus_ratelimit_allowed_total {}\n", limiter.allowed));
    output.push_str(&format!("stratus_ratelimit_rejected_total {}\n", limiter.rejected));
    output.push_str(&format!("stratus_ratelimit_store_errors_total {}\n", limiter.store_errors));

    let balancer = coordinator.balancer.metrics();
    output.push_str(&format!("stratus_balancer_requests_total {}\n", balancer.total_requests));
    output.push_str(&format!("stratus_balancer_failovers_total {}\n", balancer.failovers));
    output.push_str(&format!(
        "stratus_balancer_healthy_endpoints {}\n",
        balancer.healthy_endpoints
    ));

    for status in coordinator.breakers.statuses() {
        output.push_str(&format!(
            "stratus_breaker_rejected_total{{breaker=\"{}\"}} {}\n",
            status.name, status.rejected_calls
        ));
    }

    Response::builder()
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(output.into())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn authorized(coordinator: &Coordinator, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &coordinator.config().server.admin_token else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "admin surface disabled" })),
        )
            .into_response());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid admin token" })),
        )
            .into_response())
    }
}

async fn reset_breaker(
    State(coordinator): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorized(&coordinator, &headers) {
        return denied;
    }
    match coordinator.breakers.find(&name) {
        Some(breaker) => {
            breaker.reset();
            info!(breaker = %name, "breaker reset via admin surface");
            Json(serde_json::json!({ "status": "reset", "breaker": name })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown breaker '{name}'") })),
        )
            .into_response(),
    }
}

async fn flush_cache(State(coordinator): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorized(&coordinator, &headers) {
        return denied;
    }
    match coordinator.cache.invalidate(InvalidationScope::Global, None).await {
        Ok(_) => {
            warn!("cache flushed via admin surface");
            Json(serde_json::json!({ "status": "flushed" })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct WarmRequest {
    urls: Vec<String>,
}

async fn warm_cache(
    State(coordinator): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WarmRequest>,
) -> Response {
    if let Err(denied) = authorized(&coordinator, &headers) {
        return denied;
    }
    let count = body.urls.len();
    coordinator.cache.warm(&body.urls, stratus_cache::CacheTier::Edge).await;
    info!(count, "cache warm-up requested via admin surface");
    Json(serde_json::json!({ "status": "warming", "urls": count })).into_response()
}

async fn trigger_failover(
    State(coordinator): State<AppState>,
    Path(region): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorized(&coordinator, &headers) {
        return denied;
    }
    coordinator.balancer.trigger_failover(&region);
    coordinator.health.invalidate();
    Json(serde_json::json!({ "status": "failover_triggered", "region": region })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests_support::build_test_coordinator;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy_stack() {
        let app = create_router(build_test_coordinator());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn proxy_get_serves_and_caches() {
        let app = create_router(build_test_coordinator());

        let first = app
            .clone()
            .oneshot(Request::get("/proxy/v1/data").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
        let etag = first.headers().get("etag").unwrap().to_str().unwrap().to_string();

        let second = app
            .clone()
            .oneshot(Request::get("/proxy/v1/data").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
        assert!(second.headers().contains_key("age"));

        // conditional request revalidates against the stored etag
        let conditional = app
            .oneshot(
                Request::get("/proxy/v1/data")
                    .header("if-none-match", etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn admin_surface_requires_a_token() {
        let coordinator = build_test_coordinator();
        let app = create_router(coordinator);
        let response = app
            .oneshot(Request::post("/admin/cache/flush").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn prometheus_metrics_render_text() {
        let app = create_router(build_test_coordinator());
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("stratus_gateway_uptime_seconds"));
        assert!(text.contains("stratus_ratelimit_allowed_total"));
    }

    #[tokio::test]
    async fn observability_surface_is_readable() {
        let app = create_router(build_test_coordinator());
        for path in [
            "/v1/observability/breakers",
            "/v1/observability/rate-limit",
            "/v1/observability/replicas",
            "/v1/observability/cache",
            "/v1/observability/balancer",
            "/v1/observability/alerts",
            "/v1/observability/consensus",
            "/v1/observability/profiles",
        ] {
            let response = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }
    }

    #[tokio::test]
    async fn consensus_round_trips_over_http() {
        let app = create_router(build_test_coordinator());

        let response = app
            .clone()
            .oneshot(
                Request::post("/v1/consensus")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"subject":"approve rollout"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["consensus_id"].as_str().unwrap().to_string();

        for voter in ["a", "b", "c"] {
            let vote = format!(
                r#"{{"voter_id":"{voter}","value":{{"type":"label","value":"yes"}},"confidence":0.9}}"#
            );
            let response = app
                .clone()
                .oneshot(
                    Request::post(format!("/v1/consensus/{id}/votes"))
                        .header("content-type", "application/json")
                        .body(Body::from(vote))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(Request::get(format!("/v1/consensus/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["final_value"]["value"], "yes");
    }

    #[tokio::test]
    async fn pending_consensus_reports_conflict_status() {
        let coordinator = build_test_coordinator();
        let id = coordinator.consensus.start("quorum", vec![]);
        let app = create_router(coordinator);

        let response = app
            .oneshot(Request::get(format!("/v1/consensus/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn metric_summary_is_404_for_unknown_metrics() {
        let app = create_router(build_test_coordinator());
        let response = app
            .oneshot(
                Request::get("/v1/observability/metrics/nope/summary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_correlation_chain_is_404() {
        let app = create_router(build_test_coordinator());
        let response = app
            .oneshot(
                Request::get("/v1/observability/correlation/corr_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
