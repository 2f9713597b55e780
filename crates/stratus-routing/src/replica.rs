//! Read/write database replica router
//!
//! Tracks the health and replication lag of a primary plus N replicas.
//! Reads are admitted to replicas that satisfy the request's consistency
//! level and picked by health-derived weight; writes always go to the
//! primary. The health table is published copy-on-write: the probe task is
//! the single writer, selection reads a snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use stratus_common::{Error, Result};

/// Freshness contract a read demands from the replica layer
#[derive(Debug, Clone, PartialEq)]
pub enum ConsistencyLevel {
    /// Primary only
    Strong,
    /// Primary plus replicas lagging at most this many seconds
    BoundedStaleness(f64),
    /// Primary plus any healthy replica
    Eventual,
    /// Replicas that have caught up to the session's last write
    Session { session_id: String },
}

/// Health record for one database node
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaHealth {
    pub url: String,
    pub healthy: bool,
    pub lag_seconds: f64,
    pub active_connections: u32,
    pub avg_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: DateTime<Utc>,
}

impl ReplicaHealth {
    fn new(url: String) -> Self {
        Self {
            url,
            healthy: true,
            lag_seconds: 0.0,
            active_connections: 0,
            avg_response_time_ms: 0.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: Utc::now(),
        }
    }
}

/// Where a query should go
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub url: String,
    /// True when the node is the primary
    pub primary: bool,
    /// True when reads fell back to the primary because no replica qualified
    pub degraded: bool,
}

/// Probing interface to the database driver
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    /// Cheap liveness query (`SELECT 1`)
    async fn ping(&self, url: &str) -> Result<Duration>;
    /// Replication lag behind the primary, in seconds
    async fn replication_lag(&self, url: &str) -> Result<f64>;
    /// Active connections on the node
    async fn connection_count(&self, url: &str) -> Result<u32>;
}

/// Counters exported by the router
#[derive(Debug, Clone, Serialize)]
pub struct RouterMetrics {
    pub reads_to_replicas: u64,
    pub reads_to_primary: u64,
    pub degraded_reads: u64,
    pub writes: u64,
    pub write_failures: u64,
}

/// Health-weighted primary/replica router
pub struct ReplicaRouter {
    primary_url: String,
    replica_urls: Vec<String>,
    probe: Arc<dyn DatabaseProbe>,
    failure_threshold: u32,
    success_threshold: u32,
    probe_interval: Duration,
    health: RwLock<Arc<HashMap<String, ReplicaHealth>>>,
    primary_healthy: RwLock<bool>,
    session_writes: Mutex<HashMap<String, DateTime<Utc>>>,
    round_robin: AtomicUsize,
    reads_to_replicas: AtomicU64,
    reads_to_primary: AtomicU64,
    degraded_reads: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

impl ReplicaRouter {
    pub fn new(
        primary_url: String,
        replica_urls: Vec<String>,
        probe: Arc<dyn DatabaseProbe>,
        probe_interval: Duration,
    ) -> Self {
        let health: HashMap<String, ReplicaHealth> = replica_urls
            .iter()
            .map(|url| (url.clone(), ReplicaHealth::new(url.clone())))
            .collect();
        Self {
            primary_url,
            replica_urls,
            probe,
            failure_threshold: 3,
            success_threshold: 2,
            probe_interval,
            health: RwLock::new(Arc::new(health)),
            primary_healthy: RwLock::new(true),
            session_writes: Mutex::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
            reads_to_replicas: AtomicU64::new(0),
            reads_to_primary: AtomicU64::new(0),
            degraded_reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Pick a node for a read under the given consistency level
    pub fn route_read(&self, consistency: &ConsistencyLevel) -> Result<RouteDecision> {
        if matches!(consistency, ConsistencyLevel::Strong) {
            self.reads_to_primary.fetch_add(1, Ordering::Relaxed);
            return Ok(RouteDecision {
                url: self.primary_url.clone(),
                primary: true,
                degraded: false,
            });
        }

        let snapshot = self.health.read().clone();
        let max_lag = self.max_lag_for(consistency);
        let eligible: Vec<&ReplicaHealth> = self
            .replica_urls
            .iter()
            .filter_map(|url| snapshot.get(url))
            .filter(|h| h.healthy && max_lag.map_or(true, |bound| h.lag_seconds <= bound))
            .collect();

        if eligible.is_empty() {
            // All replicas disqualified: serve from the primary and mark the
            // response as degraded so callers can surface it.
            let degraded = !self.replica_urls.is_empty();
            if degraded {
                self.degraded_reads.fetch_add(1, Ordering::Relaxed);
            }
            self.reads_to_primary.fetch_add(1, Ordering::Relaxed);
            return Ok(RouteDecision { url: self.primary_url.clone(), primary: true, degraded });
        }

        let chosen = self.weighted_pick(&eligible);
        self.reads_to_replicas.fetch_add(1, Ordering::Relaxed);
        Ok(RouteDecision { url: chosen, primary: false, degraded: false })
    }

    /// Writes always target the primary; fail fast when it is down
    pub fn route_write(&self) -> Result<RouteDecision> {
        if !*self.primary_healthy.read() {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NoPrimary);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(RouteDecision { url: self.primary_url.clone(), primary: true, degraded: false })
    }

    /// Record a session write timestamp for SESSION consistency reads
    pub fn record_session_write(&self, session_id: &str) {
        self.session_writes.lock().insert(session_id.to_string(), Utc::now());
    }

    fn max_lag_for(&self, consistency: &ConsistencyLevel) -> Option<f64> {
        match consistency {
            ConsistencyLevel::Strong => Some(0.0),
            ConsistencyLevel::BoundedStaleness(bound) => Some(*bound),
            ConsistencyLevel::Eventual => None,
            ConsistencyLevel::Session { session_id } => {
                // A replica qualifies if its lag is within the time elapsed
                // since the session's last write.
                let writes = self.session_writes.lock();
                writes.get(session_id).map(|written_at| {
                    (Utc::now() - *written_at).num_milliseconds().max(0) as f64 / 1000.0
                })
            }
        }
    }

    /// weight = base * (1 - normalized lag) * (1 - normalized load); the
    /// heaviest replica wins, ties break round-robin
    fn weighted_pick(&self, eligible: &[&ReplicaHealth]) -> String {
        if eligible.len() == 1 {
            return eligible[0].url.clone();
        }

        let max_lag = eligible.iter().map(|h| h.lag_seconds).fold(0.0_f64, f64::max);
        let max_load =
            eligible.iter().map(|h| h.active_connections as f64).fold(0.0_f64, f64::max);

        let weights: Vec<f64> = eligible
            .iter()
            .map(|h| {
                let lag_factor =
                    if max_lag > 0.0 { 1.0 - h.lag_seconds / (max_lag * 1.0001) } else { 1.0 };
                let load_factor = if max_load > 0.0 {
                    1.0 - h.active_connections as f64 / (max_load * 1.0001)
                } else {
                    1.0
                };
                lag_factor * load_factor
            })
            .collect();

        let best = weights.iter().cloned().fold(f64::MIN, f64::max);
        let contenders: Vec<usize> = weights
            .iter()
            .enumerate()
            .filter(|(_, w)| (*w - best).abs() < 1e-9)
            .map(|(i, _)| i)
            .collect();

        let pick = if contenders.len() == 1 {
            contenders[0]
        } else {
            let turn = self.round_robin.fetch_add(1, Ordering::Relaxed);
            contenders[turn % contenders.len()]
        };
        eligible[pick].url.clone()
    }

    /// One full probe pass over the primary and every replica
    pub async fn run_probe_cycle(&self) {
        // Primary: liveness only.
        let primary_ok = self.probe.ping(&self.primary_url).await.is_ok();
        {
            let mut healthy = self.primary_healthy.write();
            if *healthy != primary_ok {
                if primary_ok {
                    info!(url = %self.primary_url, "primary recovered");
                } else {
                    warn!(url = %self.primary_url, "primary unreachable, writes will fail fast");
                }
            }
            *healthy = primary_ok;
        }

        let snapshot = self.health.read().clone();
        let mut next: HashMap<String, ReplicaHealth> = (*snapshot).clone();

        for url in &self.replica_urls {
            let record = next
                .entry(url.clone())
                .or_insert_with(|| ReplicaHealth::new(url.clone()));

            let ping = self.probe.ping(url).await;
            let lag = self.probe.replication_lag(url).await;

            match (ping, lag) {
                (Ok(elapsed), Ok(lag_seconds)) => {
                    record.consecutive_successes += 1;
                    record.consecutive_failures = 0;
                    record.lag_seconds = lag_seconds;
                    let sample = elapsed.as_secs_f64() * 1000.0;
                    record.avg_response_time_ms = if record.avg_response_time_ms == 0.0 {
                        sample
                    } else {
                        record.avg_response_time_ms * 0.7 + sample * 0.3
                    };
                    if let Ok(connections) = self.probe.connection_count(url).await {
                        record.active_connections = connections;
                    }
                    if !record.healthy
                        && record.consecutive_successes >= self.success_threshold
                    {
                        info!(url = %url, "replica marked healthy");
                        record.healthy = true;
                    }
                }
                _ => {
                    record.consecutive_failures += 1;
                    record.consecutive_successes = 0;
                    if record.healthy && record.consecutive_failures >= self.failure_threshold {
                        warn!(url = %url, "replica marked unhealthy");
                        record.healthy = false;
                    }
                }
            }
            record.last_check = Utc::now();
        }

        *self.health.write() = Arc::new(next);
    }

    /// Spawn the background probe loop; stops when the returned handle drops
    pub fn spawn_probing(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let period = router.probe_interval.max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                router.run_probe_cycle().await;
                debug!("replica probe cycle complete");
            }
        })
    }

    /// Force a replica's health flag, bypassing thresholds (used by the
    /// admin surface and tests)
    pub fn set_replica_health(&self, url: &str, healthy: bool) {
        let snapshot = self.health.read().clone();
        let mut next = (*snapshot).clone();
        if let Some(record) = next.get_mut(url) {
            record.healthy = healthy;
            if !healthy {
                record.consecutive_failures = self.failure_threshold;
                record.consecutive_successes = 0;
            }
        }
        *self.health.write() = Arc::new(next);
    }

    /// Force a replica's reported lag (used by tests and fault injection)
    pub fn set_replica_lag(&self, url: &str, lag_seconds: f64) {
        let snapshot = self.health.read().clone();
        let mut next = (*snapshot).clone();
        if let Some(record) = next.get_mut(url) {
            record.lag_seconds = lag_seconds;
        }
        *self.health.write() = Arc::new(next);
    }

    pub fn set_primary_health(&self, healthy: bool) {
        *self.primary_healthy.write() = healthy;
    }

    /// Current health table snapshot
    pub fn replica_health(&self) -> Vec<ReplicaHealth> {
        let snapshot = self.health.read().clone();
        let mut records: Vec<ReplicaHealth> = snapshot.values().cloned().collect();
        records.sort_by(|a, b| a.url.cmp(&b.url));
        records
    }

    pub fn primary_healthy(&self) -> bool {
        *self.primary_healthy.read()
    }

    pub fn metrics(&self) -> RouterMetrics {
        RouterMetrics {
            reads_to_replicas: self.reads_to_replicas.load(Ordering::Relaxed),
            reads_to_primary: self.reads_to_primary.load(Ordering::Relaxed),
            degraded_reads: self.degraded_reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Probe for deployments without a database: everything is reachable with
/// zero lag. Keeps the router wired even when only caching and balancing are
/// in use.
pub struct NoopProbe;

#[async_trait]
impl DatabaseProbe for NoopProbe {
    async fn ping(&self, _url: &str) -> Result<Duration> {
        Ok(Duration::from_millis(0))
    }

    async fn replication_lag(&self, _url: &str) -> Result<f64> {
        Ok(0.0)
    }

    async fn connection_count(&self, _url: &str) -> Result<u32> {
        Ok(0)
    }
}

/// Probe implementation backed by sqlx Postgres pools
#[cfg(feature = "postgres")]
pub mod postgres {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::{PgPool, Row};
    use std::time::Instant;

    /// Lazily pools one connection per probed node
    pub struct PgProbe {
        pools: Mutex<HashMap<String, PgPool>>,
    }

    impl PgProbe {
        pub fn new() -> Self {
            Self { pools: Mutex::new(HashMap::new()) }
        }

        async fn pool(&self, url: &str) -> Result<PgPool> {
            if let Some(pool) = self.pools.lock().get(url) {
                return Ok(pool.clone());
            }
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await
                .map_err(|e| Error::Routing(format!("database connect failed: {e}")))?;
            self.pools.lock().insert(url.to_string(), pool.clone());
            Ok(pool)
        }
    }

    impl Default for PgProbe {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl DatabaseProbe for PgProbe {
        async fn ping(&self, url: &str) -> Result<Duration> {
            let pool = self.pool(url).await?;
            let started = Instant::now();
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map_err(|e| Error::Routing(format!("ping failed: {e}")))?;
            Ok(started.elapsed())
        }

        async fn replication_lag(&self, url: &str) -> Result<f64> {
            let pool = self.pool(url).await?;
            let row = sqlx::query(
                "SELECT COALESCE(EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp()), 0)::float8 AS lag",
            )
            .fetch_one(&pool)
            .await
            .map_err(|e| Error::Routing(format!("lag query failed: {e}")))?;
            Ok(row.try_get::<f64, _>("lag").unwrap_or(0.0))
        }

        async fn connection_count(&self, url: &str) -> Result<u32> {
            let pool = self.pool(url).await?;
            let row = sqlx::query(
                "SELECT count(*)::int4 AS connections FROM pg_stat_activity WHERE state = 'active'",
            )
            .fetch_one(&pool)
            .await
            .map_err(|e| Error::Routing(format!("connection query failed: {e}")))?;
            Ok(row.try_get::<i32, _>("connections").unwrap_or(0) as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProbe {
        lags: Mutex<HashMap<String, f64>>,
        down: Mutex<std::collections::HashSet<String>>,
    }

    impl ScriptedProbe {
        fn new() -> Self {
            Self {
                lags: Mutex::new(HashMap::new()),
                down: Mutex::new(std::collections::HashSet::new()),
            }
        }

        fn set_lag(&self, url: &str, lag: f64) {
            self.lags.lock().insert(url.to_string(), lag);
        }

        fn set_down(&self, url: &str, down: bool) {
            if down {
                self.down.lock().insert(url.to_string());
            } else {
                self.down.lock().remove(url);
            }
        }
    }

    #[async_trait]
    impl DatabaseProbe for ScriptedProbe {
        async fn ping(&self, url: &str) -> Result<Duration> {
            if self.down.lock().contains(url) {
                Err(Error::Routing("connection refused".into()))
            } else {
                Ok(Duration::from_millis(2))
            }
        }

        async fn replication_lag(&self, url: &str) -> Result<f64> {
            if self.down.lock().contains(url) {
                Err(Error::Routing("connection refused".into()))
            } else {
                Ok(*self.lags.lock().get(url).unwrap_or(&0.0))
            }
        }

        async fn connection_count(&self, _url: &str) -> Result<u32> {
            Ok(0)
        }
    }

    fn router_with(probe: Arc<ScriptedProbe>) -> ReplicaRouter {
        ReplicaRouter::new(
            "postgres://primary".into(),
            vec!["postgres://r1".into(), "postgres://r2".into()],
            probe,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn strong_reads_go_to_primary() {
        let router = router_with(Arc::new(ScriptedProbe::new()));
        let decision = router.route_read(&ConsistencyLevel::Strong).unwrap();
        assert_eq!(decision.url, "postgres://primary");
        assert!(decision.primary);
        assert!(!decision.degraded);
    }

    #[tokio::test]
    async fn bounded_staleness_excludes_lagging_replicas() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_lag("postgres://r1", 0.2);
        probe.set_lag("postgres://r2", 8.0);
        let router = router_with(probe);
        router.run_probe_cycle().await;

        let decision = router.route_read(&ConsistencyLevel::BoundedStaleness(1.0)).unwrap();
        assert_eq!(decision.url, "postgres://r1");
        assert!(!decision.degraded);
    }

    #[tokio::test]
    async fn falls_back_to_primary_degraded_when_no_replica_qualifies() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_lag("postgres://r1", 0.2);
        probe.set_lag("postgres://r2", 8.0);
        let router = router_with(probe);
        router.run_probe_cycle().await;
        router.set_replica_health("postgres://r1", false);

        let decision = router.route_read(&ConsistencyLevel::BoundedStaleness(1.0)).unwrap();
        assert_eq!(decision.url, "postgres://primary");
        assert!(decision.degraded);
        assert_eq!(router.metrics().degraded_reads, 1);
    }

    #[tokio::test]
    async fn eventual_reads_spread_round_robin_over_equal_replicas() {
        let router = router_with(Arc::new(ScriptedProbe::new()));
        let first = router.route_read(&ConsistencyLevel::Eventual).unwrap();
        let second = router.route_read(&ConsistencyLevel::Eventual).unwrap();
        assert_ne!(first.url, second.url);
    }

    #[tokio::test]
    async fn writes_fail_fast_without_primary() {
        let router = router_with(Arc::new(ScriptedProbe::new()));
        assert!(router.route_write().is_ok());

        router.set_primary_health(false);
        let err = router.route_write().unwrap_err();
        assert!(matches!(err, Error::NoPrimary));
        assert_eq!(router.metrics().write_failures, 1);
    }

    #[tokio::test]
    async fn probe_cycle_marks_replicas_unhealthy_after_three_failures() {
        let probe = Arc::new(ScriptedProbe::new());
        let router = router_with(probe.clone());
        probe.set_down("postgres://r1", true);

        for _ in 0..2 {
            router.run_probe_cycle().await;
        }
        assert!(router.replica_health().iter().find(|h| h.url.ends_with("r1")).unwrap().healthy);

        router.run_probe_cycle().await;
        let health = router.replica_health();
        let r1 = health.iter().find(|h| h.url.ends_with("r1")).unwrap();
        assert!(!r1.healthy);

        // two clean probes bring it back
        probe.set_down("postgres://r1", false);
        router.run_probe_cycle().await;
        router.run_probe_cycle().await;
        let health = router.replica_health();
        assert!(health.iter().find(|h| h.url.ends_with("r1")).unwrap().healthy);
    }

    #[tokio::test]
    async fn session_reads_require_caught_up_replicas() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set_lag("postgres://r1", 0.0);
        probe.set_lag("postgres://r2", 30.0);
        let router = router_with(probe);
        router.run_probe_cycle().await;

        router.record_session_write("sess-1");
        let decision = router
            .route_read(&ConsistencyLevel::Session { session_id: "sess-1".into() })
            .unwrap();
        // Only the caught-up replica is within the session's write horizon.
        assert_eq!(decision.url, "postgres://r1");
    }
}
