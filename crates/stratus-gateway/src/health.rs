//! Health aggregation across every component
//!
//! All component checks run concurrently with a per-check timeout, and the
//! aggregate is cached briefly so health probes cannot stampede the
//! components they are watching.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use stratus_cache::{CacheEntry, CacheStrategy, CacheTier};
use stratus_common::{ComponentHealth, HealthLevel, HealthStatus};
use stratus_resilience::CircuitState;

use crate::coordinator::Coordinator;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Caches the aggregated health status between probe bursts
pub struct HealthAggregator {
    cached: Mutex<Option<(HealthStatus, Instant)>>,
    cache_ttl: Duration,
}

impl HealthAggregator {
    pub fn new(cache_ttl: Duration) -> Self {
        Self { cached: Mutex::new(None), cache_ttl }
    }

    /// Run every component check concurrently and aggregate the result
    pub async fn check(&self, coordinator: &Coordinator) -> HealthStatus {
        if let Some((status, at)) = self.cached.lock().as_ref() {
            if at.elapsed() < self.cache_ttl {
                return status.clone();
            }
        }

        let (breakers, limiter, replicas, cache, balancer) = tokio::join!(
            bounded(check_breakers(coordinator)),
            bounded(check_rate_limiting(coordinator)),
            bounded(check_replicas(coordinator)),
            bounded(check_cache(coordinator)),
            bounded(check_balancer(coordinator)),
        );

        let mut components = HashMap::new();
        components.insert("circuit_breakers".to_string(), breakers);
        components.insert("rate_limiting".to_string(), limiter);
        components.insert("database_replicas".to_string(), replicas);
        components.insert("edge_cache".to_string(), cache);
        components.insert("global_load_balancer".to_string(), balancer);

        let status = HealthStatus::aggregate(components, coordinator.uptime_seconds());
        *self.cached.lock() = Some((status.clone(), Instant::now()));
        status
    }

    /// Drop the cached aggregate so the next check runs fresh
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

/// Enforce the per-check timeout; a check that hangs is itself unhealthy
async fn bounded(
    check: impl std::future::Future<Output = ComponentHealth>,
) -> ComponentHealth {
    match tokio::time::timeout(CHECK_TIMEOUT, check).await {
        Ok(health) => health,
        Err(_) => {
            warn!("component health check timed out");
            ComponentHealth::at_level(HealthLevel::Unhealthy, "health check timed out")
        }
    }
}

async fn check_breakers(coordinator: &Coordinator) -> ComponentHealth {
    let open = coordinator.breakers.names_in_state(CircuitState::Open);
    let half_open = coordinator.breakers.names_in_state(CircuitState::HalfOpen);

    let health = if !open.is_empty() {
        ComponentHealth::at_level(
            HealthLevel::Degraded,
            format!("circuit breakers open: {}", open.join(", ")),
        )
    } else if !half_open.is_empty() {
        ComponentHealth::at_level(
            HealthLevel::Degraded,
            format!("circuit breakers recovering: {}", half_open.join(", ")),
        )
    } else {
        ComponentHealth::healthy("all circuits closed")
    };
    health
        .with_metric("open", open.len() as f64)
        .with_metric("half_open", half_open.len() as f64)
}

async fn check_rate_limiting(coordinator: &Coordinator) -> ComponentHealth {
    let stats = coordinator.limiter.stats();
    match coordinator.store.ping().await {
        Ok(()) => ComponentHealth::healthy("rate limit store reachable")
            .with_metric("allowed", stats.allowed as f64)
            .with_metric("rejected", stats.rejected as f64),
        Err(e) => {
            let level = if stats.fail_open {
                HealthLevel::Degraded
            } else {
                HealthLevel::Unhealthy
            };
            ComponentHealth::at_level(level, format!("rate limit store unreachable: {e}"))
                .with_metric("store_errors", stats.store_errors as f64)
        }
    }
}

async fn check_replicas(coordinator: &Coordinator) -> ComponentHealth {
    let replicas = coordinator.replicas.replica_health();
    if !coordinator.replicas.primary_healthy() {
        return ComponentHealth::at_level(HealthLevel::Critical, "primary unreachable");
    }
    if replicas.is_empty() {
        return ComponentHealth::healthy("no replicas configured");
    }

    let unhealthy: Vec<&str> =
        replicas.iter().filter(|r| !r.healthy).map(|r| r.url.as_str()).collect();
    let lagging: Vec<&str> = replicas
        .iter()
        .filter(|r| r.healthy && r.lag_seconds > 5.0)
        .map(|r| r.url.as_str())
        .collect();

    let health = if unhealthy.len() == replicas.len() {
        ComponentHealth::at_level(HealthLevel::Critical, "all replicas unhealthy")
    } else if !unhealthy.is_empty() {
        ComponentHealth::at_level(
            HealthLevel::Degraded,
            format!("unhealthy replicas: {}", unhealthy.join(", ")),
        )
    } else if !lagging.is_empty() {
        ComponentHealth::at_level(
            HealthLevel::Degraded,
            format!("high lag replicas: {}", lagging.join(", ")),
        )
    } else {
        ComponentHealth::healthy(format!("{} replicas healthy", replicas.len()))
    };
    health
        .with_metric("replicas", replicas.len() as f64)
        .with_metric("unhealthy", unhealthy.len() as f64)
}

async fn check_cache(coordinator: &Coordinator) -> ComponentHealth {
    // Round-trip a probe entry through the edge tier.
    let key = format!("cache:health:{}", uuid::Uuid::new_v4().simple());
    let entry = CacheEntry::new(key.clone(), b"ok".to_vec(), "text/plain", Duration::from_secs(5));

    let wrote = coordinator.cache.set(&key, entry, CacheTier::Edge).await.is_ok();
    let read = coordinator
        .cache
        .get(&key, CacheTier::Edge, CacheStrategy::CacheOnly)
        .await
        .is_some();
    let metrics = coordinator.cache.metrics();
    let edge_hit_rate = metrics.get("edge").map(|m| m.hit_rate).unwrap_or(0.0);

    let health = if wrote && read {
        ComponentHealth::healthy(format!("cache operational, hit rate {edge_hit_rate:.1}%"))
    } else if wrote || read {
        ComponentHealth::at_level(HealthLevel::Degraded, "cache operations partially failing")
    } else {
        ComponentHealth::at_level(HealthLevel::Unhealthy, "cache store unreachable")
    };
    health.with_metric("edge_hit_rate", edge_hit_rate)
}

async fn check_balancer(coordinator: &Coordinator) -> ComponentHealth {
    let metrics = coordinator.balancer.metrics();
    if metrics.total_endpoints == 0 {
        return ComponentHealth::healthy("no regions configured");
    }

    let health = if metrics.healthy_endpoints == 0 {
        ComponentHealth::at_level(HealthLevel::Critical, "no healthy endpoints in any region")
    } else if metrics.healthy_endpoints < metrics.total_endpoints {
        ComponentHealth::at_level(
            HealthLevel::Degraded,
            format!(
                "{}/{} endpoints healthy",
                metrics.healthy_endpoints, metrics.total_endpoints
            ),
        )
    } else {
        ComponentHealth::healthy("all endpoints healthy")
    };
    health
        .with_metric("healthy_endpoints", metrics.healthy_endpoints as f64)
        .with_metric("total_endpoints", metrics.total_endpoints as f64)
        .with_metric("failovers", metrics.failovers as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests_support::build_test_coordinator;

    #[tokio::test]
    async fn healthy_stack_aggregates_healthy() {
        let coordinator = build_test_coordinator();
        let status = coordinator.health.check(&coordinator).await;
        assert_eq!(status.overall, HealthLevel::Healthy);
        assert_eq!(status.overall.http_status(), 200);
        assert!(status.components.contains_key("edge_cache"));
    }

    #[tokio::test]
    async fn open_breaker_degrades_the_aggregate() {
        let coordinator = build_test_coordinator();
        coordinator.breakers.get("origin").force_open();
        coordinator.health.invalidate();

        let status = coordinator.health.check(&coordinator).await;
        assert_eq!(status.overall, HealthLevel::Degraded);
        assert_eq!(status.components["circuit_breakers"].status, HealthLevel::Degraded);
    }

    #[tokio::test]
    async fn dead_region_is_critical() {
        let coordinator = build_test_coordinator();
        coordinator.balancer.trigger_failover("us-east-1");
        coordinator.health.invalidate();

        let status = coordinator.health.check(&coordinator).await;
        assert_eq!(status.overall, HealthLevel::Critical);
        assert_eq!(status.overall.http_status(), 503);
    }

    #[tokio::test]
    async fn results_are_cached_between_probes() {
        let coordinator = build_test_coordinator();
        let first = coordinator.health.check(&coordinator).await;
        // a state change without invalidation is masked by the cache
        coordinator.breakers.get("origin").force_open();
        let second = coordinator.health.check(&coordinator).await;
        assert_eq!(first.overall, second.overall);
    }
}
