//! Global server load balancing
//!
//! Distributes traffic across deployment regions under one of six routing
//! policies, with continuous endpoint health probing, a TTL-bounded routing
//! decision cache and a capacity manager that emits scale hints.

pub mod geo;

pub use geo::{GeoPoint, GeoResolver, MaxMindResolver, NullGeoResolver, StaticGeoResolver};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use stratus_common::config::{RegionConfig, RoutingPolicy};
use stratus_common::{Error, Result};

/// A deployment region under management
#[derive(Debug)]
pub struct Region {
    pub code: String,
    pub name: String,
    pub location: GeoPoint,
    pub endpoints: Vec<String>,
    /// Requests per second the region can absorb
    pub capacity: u64,
    pub cost_per_million: f64,
    pub active: bool,
    current_load: AtomicU64,
}

impl Region {
    fn from_config(config: &RegionConfig) -> Self {
        Self {
            code: config.code.clone(),
            name: config.name.clone(),
            location: GeoPoint { latitude: config.latitude, longitude: config.longitude },
            endpoints: config.endpoints.clone(),
            capacity: config.capacity,
            cost_per_million: config.cost_per_million,
            active: config.active,
            current_load: AtomicU64::new(0),
        }
    }
}

/// Health state of a single endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub region: String,
    pub healthy: bool,
    pub latency_ms: f64,
    pub availability: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: DateTime<Utc>,
    #[serde(skip)]
    response_times: VecDeque<f64>,
}

impl EndpointHealth {
    fn new(endpoint: String, region: String) -> Self {
        Self {
            endpoint,
            region,
            healthy: true,
            latency_ms: 0.0,
            availability: 100.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: Utc::now(),
            response_times: VecDeque::with_capacity(100),
        }
    }
}

/// Active endpoint probing interface
#[async_trait]
pub trait EndpointProber: Send + Sync {
    /// Round-trip a health request; `Ok` carries the observed latency
    async fn probe(&self, endpoint: &str) -> Result<Duration>;
}

/// `GET https://<endpoint><path>` prober used in production
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
}

impl HttpProber {
    pub fn new(path: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, path }
    }
}

#[async_trait]
impl EndpointProber for HttpProber {
    async fn probe(&self, endpoint: &str) -> Result<Duration> {
        let url = format!("https://{}{}", endpoint, self.path);
        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Routing(format!("probe failed: {e}")))?;
        if response.status().is_server_error() {
            return Err(Error::Routing(format!("probe returned {}", response.status())));
        }
        Ok(started.elapsed())
    }
}

/// Balancer tuning knobs
#[derive(Debug, Clone)]
pub struct BalancerSettings {
    pub policy: RoutingPolicy,
    pub max_endpoints: usize,
    pub dns_ttl: Duration,
    pub probe_interval: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub endpoint_weights: HashMap<String, u32>,
    pub failover_order: Vec<String>,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            policy: RoutingPolicy::Geoproximity,
            max_endpoints: 4,
            dns_ttl: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
            failure_threshold: 3,
            success_threshold: 2,
            endpoint_weights: HashMap::new(),
            failover_order: Vec::new(),
        }
    }
}

/// Exported balancer metrics
#[derive(Debug, Clone, Serialize)]
pub struct BalancerMetrics {
    pub total_requests: u64,
    pub requests_by_region: HashMap<String, u64>,
    pub average_routing_latency_ms: f64,
    pub cache_hits: u64,
    pub failovers: u64,
    pub errors: u64,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
}

struct CachedRoute {
    endpoints: Vec<String>,
    inserted: Instant,
}

const ROUTING_CACHE_CAPACITY: usize = 10_000;

/// Global load balancer over a set of regions
pub struct GlobalBalancer {
    regions: HashMap<String, Arc<Region>>,
    endpoint_region: HashMap<String, String>,
    settings: BalancerSettings,
    prober: Arc<dyn EndpointProber>,
    geo: Arc<dyn GeoResolver>,
    health: RwLock<HashMap<String, EndpointHealth>>,
    cache: Mutex<HashMap<String, CachedRoute>>,
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    failovers: AtomicU64,
    errors: AtomicU64,
    requests_by_region: Mutex<HashMap<String, u64>>,
    routing_latency: Mutex<(f64, u64)>,
}

impl GlobalBalancer {
    pub fn new(
        region_configs: &[RegionConfig],
        settings: BalancerSettings,
        prober: Arc<dyn EndpointProber>,
        geo: Arc<dyn GeoResolver>,
    ) -> Self {
        let regions: HashMap<String, Arc<Region>> = region_configs
            .iter()
            .map(|c| (c.code.clone(), Arc::new(Region::from_config(c))))
            .collect();

        let mut endpoint_region = HashMap::new();
        let mut health = HashMap::new();
        for region in regions.values() {
            for endpoint in &region.endpoints {
                endpoint_region.insert(endpoint.clone(), region.code.clone());
                health.insert(
                    endpoint.clone(),
                    EndpointHealth::new(endpoint.clone(), region.code.clone()),
                );
            }
        }

        Self {
            regions,
            endpoint_region,
            settings,
            prober,
            geo,
            health: RwLock::new(health),
            cache: Mutex::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            requests_by_region: Mutex::new(HashMap::new()),
            routing_latency: Mutex::new((0.0, 0)),
        }
    }

    /// Route a request to its best endpoints under the configured policy
    pub async fn route(&self, client_ip: IpAddr, path: &str, method: &str) -> Result<Vec<String>> {
        let started = Instant::now();
        let cache_key = format!("{client_ip}:{path}:{method}");

        if let Some(cached) = self.cache_lookup(&cache_key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        let healthy = self.healthy_endpoints();
        if healthy.is_empty() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NoHealthyEndpoint("no endpoint passed health checks".into()));
        }

        let selected = self.apply_policy(healthy, client_ip).await;
        if selected.is_empty() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NoHealthyEndpoint("routing policy produced no endpoints".into()));
        }

        self.cache_store(cache_key, selected.clone());
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(first) = selected.first() {
            if let Some(region) = self.endpoint_region.get(first) {
                *self.requests_by_region.lock().entry(region.clone()).or_insert(0) += 1;
            }
        }
        {
            let mut latency = self.routing_latency.lock();
            let sample = started.elapsed().as_secs_f64() * 1000.0;
            latency.1 += 1;
            latency.0 += (sample - latency.0) / latency.1 as f64;
        }

        Ok(selected)
    }

    fn healthy_endpoints(&self) -> Vec<String> {
        let health = self.health.read();
        let mut endpoints: Vec<String> = health
            .values()
            .filter(|h| h.healthy)
            .filter(|h| self.regions.get(&h.region).is_some_and(|r| r.active))
            .map(|h| h.endpoint.clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    async fn apply_policy(&self, endpoints: Vec<String>, client_ip: IpAddr) -> Vec<String> {
        let n = self.settings.max_endpoints;
        match self.settings.policy {
            RoutingPolicy::Geoproximity => match self.geo.locate(client_ip) {
                Some(client) => self.sort_by_distance(endpoints, client, n),
                // No location for the client: fall back to measured latency.
                None => self.sort_by_latency(endpoints, n).await,
            },
            RoutingPolicy::Latency => self.sort_by_latency(endpoints, n).await,
            RoutingPolicy::Weighted => self.weighted_draw(endpoints, n),
            RoutingPolicy::Cost => self.sort_by_cost(endpoints, n),
            RoutingPolicy::Failover => self.first_in_failover_order(endpoints),
            RoutingPolicy::Multivalue => endpoints.into_iter().take(n).collect(),
        }
    }

    fn sort_by_distance(
        &self,
        mut endpoints: Vec<String>,
        client: GeoPoint,
        n: usize,
    ) -> Vec<String> {
        let distance = |endpoint: &String| -> f64 {
            self.endpoint_region
                .get(endpoint)
                .and_then(|code| self.regions.get(code))
                .map(|region| geo::haversine_km(client, region.location))
                .unwrap_or(f64::INFINITY)
        };
        endpoints.sort_by(|a, b| {
            distance(a).partial_cmp(&distance(b)).unwrap_or(std::cmp::Ordering::Equal)
        });
        endpoints.truncate(n);
        endpoints
    }

    async fn sort_by_latency(&self, endpoints: Vec<String>, n: usize) -> Vec<String> {
        let probes = endpoints.iter().map(|endpoint| {
            let prober = self.prober.clone();
            let endpoint = endpoint.clone();
            async move {
                let rtt = match prober.probe(&endpoint).await {
                    Ok(elapsed) => elapsed.as_secs_f64() * 1000.0,
                    Err(_) => f64::INFINITY,
                };
                (endpoint, rtt)
            }
        });
        let mut measured: Vec<(String, f64)> = join_all(probes).await;
        measured.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        measured.into_iter().take(n).map(|(endpoint, _)| endpoint).collect()
    }

    fn weighted_draw(&self, endpoints: Vec<String>, n: usize) -> Vec<String> {
        let mut remaining = endpoints;
        let mut selected = Vec::new();
        let mut rng = rand::thread_rng();

        while selected.len() < n && !remaining.is_empty() {
            let weights: Vec<u64> = remaining
                .iter()
                .map(|e| u64::from(*self.settings.endpoint_weights.get(e).unwrap_or(&1)))
                .collect();
            let total: u64 = weights.iter().sum();
            let mut draw = rng.gen_range(0..total.max(1));
            let mut index = 0;
            for (i, weight) in weights.iter().enumerate() {
                if draw < *weight {
                    index = i;
                    break;
                }
                draw -= weight;
            }
            selected.push(remaining.remove(index));
        }
        selected
    }

    fn sort_by_cost(&self, mut endpoints: Vec<String>, n: usize) -> Vec<String> {
        let health = self.health.read();
        let score = |endpoint: &String| -> f64 {
            let cost = self
                .endpoint_region
                .get(endpoint)
                .and_then(|code| self.regions.get(code))
                .map(|region| region.cost_per_million)
                .unwrap_or(1.0);
            let availability =
                health.get(endpoint).map(|h| h.availability).unwrap_or(0.0);
            if availability <= 0.0 {
                f64::INFINITY
            } else {
                cost / (availability / 100.0)
            }
        };
        endpoints
            .sort_by(|a, b| score(a).partial_cmp(&score(b)).unwrap_or(std::cmp::Ordering::Equal));
        endpoints.truncate(n);
        endpoints
    }

    fn first_in_failover_order(&self, endpoints: Vec<String>) -> Vec<String> {
        for preferred in &self.settings.failover_order {
            if endpoints.contains(preferred) {
                return vec![preferred.clone()];
            }
        }
        endpoints.into_iter().take(1).collect()
    }

    fn cache_lookup(&self, key: &str) -> Option<Vec<String>> {
        let cache = self.cache.lock();
        let entry = cache.get(key)?;
        (entry.inserted.elapsed() < self.settings.dns_ttl).then(|| entry.endpoints.clone())
    }

    fn cache_store(&self, key: String, endpoints: Vec<String>) {
        let mut cache = self.cache.lock();
        if cache.len() >= ROUTING_CACHE_CAPACITY {
            // Oldest-first purge keeps the map bounded.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(key, CachedRoute { endpoints, inserted: Instant::now() });
    }

    /// One probe pass over every endpoint
    pub async fn run_probe_cycle(&self) {
        let endpoints: Vec<String> = self.endpoint_region.keys().cloned().collect();
        let results = join_all(endpoints.iter().map(|endpoint| {
            let prober = self.prober.clone();
            let endpoint = endpoint.clone();
            async move {
                let outcome = prober.probe(&endpoint).await;
                (endpoint, outcome)
            }
        }))
        .await;

        let mut flush_needed = false;
        {
            let mut health = self.health.write();
            for (endpoint, outcome) in results {
                let Some(record) = health.get_mut(&endpoint) else { continue };
                match outcome {
                    Ok(elapsed) => {
                        let sample = elapsed.as_secs_f64() * 1000.0;
                        record.consecutive_successes += 1;
                        record.consecutive_failures = 0;
                        record.latency_ms = sample;
                        if record.response_times.len() >= 100 {
                            record.response_times.pop_front();
                        }
                        record.response_times.push_back(sample);
                        record.availability = (record.availability * 0.99 + 1.0).min(100.0);
                        if !record.healthy
                            && record.consecutive_successes >= self.settings.success_threshold
                        {
                            info!(endpoint = %endpoint, "endpoint marked healthy");
                            record.healthy = true;
                        }
                    }
                    Err(e) => {
                        record.consecutive_failures += 1;
                        record.consecutive_successes = 0;
                        record.availability = (record.availability * 0.99).max(0.0);
                        if record.healthy
                            && record.consecutive_failures >= self.settings.failure_threshold
                        {
                            warn!(endpoint = %endpoint, "endpoint marked unhealthy: {e}");
                            record.healthy = false;
                            flush_needed = true;
                        }
                    }
                }
                record.last_check = Utc::now();
            }
        }

        if flush_needed {
            self.failovers.fetch_add(1, Ordering::Relaxed);
            self.flush_routing_cache();
        }
    }

    /// Spawn the continuous health-probe loop
    pub fn spawn_probing(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let period = balancer.settings.probe_interval.max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                balancer.run_probe_cycle().await;
                debug!("endpoint probe cycle complete");
            }
        })
    }

    /// Manually fail a region: its endpoints go unhealthy and the routing
    /// cache is flushed so the next decision re-evaluates
    pub fn trigger_failover(&self, region_code: &str) {
        warn!(region = region_code, "manual failover triggered");
        let mut health = self.health.write();
        for record in health.values_mut() {
            if record.region == region_code {
                record.healthy = false;
                record.consecutive_failures = self.settings.failure_threshold;
                record.consecutive_successes = 0;
            }
        }
        drop(health);
        self.failovers.fetch_add(1, Ordering::Relaxed);
        self.flush_routing_cache();
    }

    /// Restore a region's endpoints (admin surface and tests)
    pub fn restore_region(&self, region_code: &str) {
        let mut health = self.health.write();
        for record in health.values_mut() {
            if record.region == region_code {
                record.healthy = true;
                record.consecutive_failures = 0;
            }
        }
        drop(health);
        self.flush_routing_cache();
    }

    pub fn flush_routing_cache(&self) {
        self.cache.lock().clear();
    }

    /// Count a dispatched request against a region's capacity
    pub fn record_dispatch(&self, endpoint: &str) {
        if let Some(region) =
            self.endpoint_region.get(endpoint).and_then(|code| self.regions.get(code))
        {
            region.current_load.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Compute per-region load, emit scale hints, reset counters.
    ///
    /// Returns `(region code, load percentage)` pairs so the caller can
    /// export them as gauges; this manager never scales anything itself.
    pub fn run_capacity_cycle(&self) -> Vec<(String, f64)> {
        let mut report = Vec::new();
        for region in self.regions.values() {
            let load = region.current_load.swap(0, Ordering::Relaxed);
            let pct = if region.capacity > 0 {
                load as f64 / region.capacity as f64 * 100.0
            } else {
                0.0
            };
            if pct > 80.0 {
                warn!(region = %region.code, load_pct = pct, "region above 80% capacity, scale up");
            } else if pct < 20.0 && region.endpoints.len() > 1 {
                info!(region = %region.code, load_pct = pct, "region underutilized, scale down");
            }
            report.push((region.code.clone(), pct));
        }
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Spawn the periodic capacity manager
    pub fn spawn_capacity_manager(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                balancer.run_capacity_cycle();
            }
        })
    }

    /// Resolve a hostname to addresses picked by the routing policy;
    /// answers should be served with `dns_ttl`
    pub async fn resolve(&self, client_ip: IpAddr) -> Result<Vec<IpAddr>> {
        let endpoints = self.route(client_ip, "/", "DNS").await?;
        let mut addresses = Vec::new();
        for endpoint in endpoints {
            let host = endpoint.split(':').next().unwrap_or(&endpoint).to_string();
            if let Ok(ip) = host.parse::<IpAddr>() {
                addresses.push(ip);
                continue;
            }
            let lookup_result = tokio::net::lookup_host((host.as_str(), 443)).await;
            match lookup_result {
                Ok(resolved) => addresses.extend(resolved.map(|addr| addr.ip())),
                Err(e) => warn!(endpoint = %endpoint, "dns resolution failed: {e}"),
            }
        }
        Ok(addresses)
    }

    pub fn dns_ttl(&self) -> Duration {
        self.settings.dns_ttl
    }

    /// Endpoint health snapshot, sorted by endpoint
    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        let health = self.health.read();
        let mut records: Vec<EndpointHealth> = health.values().cloned().collect();
        records.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        records
    }

    pub fn metrics(&self) -> BalancerMetrics {
        let health = self.health.read();
        let healthy = health.values().filter(|h| h.healthy).count();
        BalancerMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            requests_by_region: self.requests_by_region.lock().clone(),
            average_routing_latency_ms: self.routing_latency.lock().0,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            healthy_endpoints: healthy,
            total_endpoints: health.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProber {
        latencies: Mutex<HashMap<String, f64>>,
        down: Mutex<std::collections::HashSet<String>>,
    }

    impl ScriptedProber {
        fn new() -> Self {
            Self {
                latencies: Mutex::new(HashMap::new()),
                down: Mutex::new(std::collections::HashSet::new()),
            }
        }

        fn set_latency(&self, endpoint: &str, ms: f64) {
            self.latencies.lock().insert(endpoint.to_string(), ms);
        }

        fn set_down(&self, endpoint: &str, down: bool) {
            if down {
                self.down.lock().insert(endpoint.to_string());
            } else {
                self.down.lock().remove(endpoint);
            }
        }
    }

    #[async_trait]
    impl EndpointProber for ScriptedProber {
        async fn probe(&self, endpoint: &str) -> Result<Duration> {
            if self.down.lock().contains(endpoint) {
                return Err(Error::Routing("connection refused".into()));
            }
            let ms = *self.latencies.lock().get(endpoint).unwrap_or(&10.0);
            Ok(Duration::from_secs_f64(ms / 1000.0))
        }
    }

    fn two_regions() -> Vec<RegionConfig> {
        vec![
            RegionConfig {
                code: "us-east-1".into(),
                name: "N. Virginia".into(),
                latitude: 40.7,
                longitude: -74.0,
                endpoints: vec!["api-use1.example.com".into()],
                capacity: 1000,
                cost_per_million: 1.0,
                active: true,
            },
            RegionConfig {
                code: "eu-west-1".into(),
                name: "Ireland".into(),
                latitude: 53.3,
                longitude: -6.3,
                endpoints: vec!["api-euw1.example.com".into()],
                capacity: 1000,
                cost_per_million: 0.8,
                active: true,
            },
        ]
    }

    fn client_ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn new_york_resolver() -> Arc<StaticGeoResolver> {
        Arc::new(
            StaticGeoResolver::new()
                .with(client_ip(), GeoPoint { latitude: 40.7, longitude: -74.0 }),
        )
    }

    fn balancer(policy: RoutingPolicy, prober: Arc<ScriptedProber>) -> GlobalBalancer {
        let settings = BalancerSettings {
            policy,
            max_endpoints: 4,
            dns_ttl: Duration::from_secs(60),
            ..BalancerSettings::default()
        };
        GlobalBalancer::new(&two_regions(), settings, prober, new_york_resolver())
    }

    #[tokio::test]
    async fn geoproximity_picks_the_nearest_region() {
        let balancer = balancer(RoutingPolicy::Geoproximity, Arc::new(ScriptedProber::new()));
        let endpoints = balancer.route(client_ip(), "/", "GET").await.unwrap();
        assert_eq!(endpoints[0], "api-use1.example.com");
    }

    #[tokio::test]
    async fn geoproximity_fails_over_when_region_is_down() {
        let balancer = balancer(RoutingPolicy::Geoproximity, Arc::new(ScriptedProber::new()));
        balancer.trigger_failover("us-east-1");
        let endpoints = balancer.route(client_ip(), "/", "GET").await.unwrap();
        assert_eq!(endpoints, vec!["api-euw1.example.com".to_string()]);
    }

    #[tokio::test]
    async fn unknown_client_location_degrades_to_latency() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set_latency("api-use1.example.com", 120.0);
        prober.set_latency("api-euw1.example.com", 15.0);
        let settings = BalancerSettings {
            policy: RoutingPolicy::Geoproximity,
            ..BalancerSettings::default()
        };
        let balancer = GlobalBalancer::new(
            &two_regions(),
            settings,
            prober,
            Arc::new(NullGeoResolver),
        );

        let endpoints = balancer.route(client_ip(), "/", "GET").await.unwrap();
        assert_eq!(endpoints[0], "api-euw1.example.com");
    }

    #[tokio::test]
    async fn latency_policy_orders_by_measured_rtt() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set_latency("api-use1.example.com", 80.0);
        prober.set_latency("api-euw1.example.com", 20.0);
        let balancer = balancer(RoutingPolicy::Latency, prober);

        let endpoints = balancer.route(client_ip(), "/", "GET").await.unwrap();
        assert_eq!(
            endpoints,
            vec!["api-euw1.example.com".to_string(), "api-use1.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn cost_policy_prefers_cheap_available_regions() {
        let balancer = balancer(RoutingPolicy::Cost, Arc::new(ScriptedProber::new()));
        let endpoints = balancer.route(client_ip(), "/", "GET").await.unwrap();
        // eu-west-1 costs 0.8 per million against 1.0
        assert_eq!(endpoints[0], "api-euw1.example.com");
    }

    #[tokio::test]
    async fn failover_policy_follows_the_configured_order() {
        let prober = Arc::new(ScriptedProber::new());
        let settings = BalancerSettings {
            policy: RoutingPolicy::Failover,
            failover_order: vec![
                "api-use1.example.com".to_string(),
                "api-euw1.example.com".to_string(),
            ],
            ..BalancerSettings::default()
        };
        let balancer =
            GlobalBalancer::new(&two_regions(), settings, prober, new_york_resolver());

        assert_eq!(
            balancer.route(client_ip(), "/", "GET").await.unwrap(),
            vec!["api-use1.example.com".to_string()]
        );

        balancer.trigger_failover("us-east-1");
        assert_eq!(
            balancer.route(client_ip(), "/", "GET").await.unwrap(),
            vec!["api-euw1.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn multivalue_returns_up_to_max_endpoints() {
        let settings = BalancerSettings {
            policy: RoutingPolicy::Multivalue,
            max_endpoints: 1,
            ..BalancerSettings::default()
        };
        let balancer = GlobalBalancer::new(
            &two_regions(),
            settings,
            Arc::new(ScriptedProber::new()),
            new_york_resolver(),
        );
        let endpoints = balancer.route(client_ip(), "/", "GET").await.unwrap();
        assert_eq!(endpoints.len(), 1);
    }

    #[tokio::test]
    async fn weighted_policy_returns_all_configured_endpoints() {
        let mut weights = HashMap::new();
        weights.insert("api-use1.example.com".to_string(), 9);
        weights.insert("api-euw1.example.com".to_string(), 1);
        let settings = BalancerSettings {
            policy: RoutingPolicy::Weighted,
            endpoint_weights: weights,
            ..BalancerSettings::default()
        };
        let balancer = GlobalBalancer::new(
            &two_regions(),
            settings,
            Arc::new(ScriptedProber::new()),
            new_york_resolver(),
        );
        let endpoints = balancer.route(client_ip(), "/", "GET").await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.contains(&"api-use1.example.com".to_string()));
    }

    #[tokio::test]
    async fn routing_decisions_are_cached_within_ttl() {
        let balancer = balancer(RoutingPolicy::Geoproximity, Arc::new(ScriptedProber::new()));
        let first = balancer.route(client_ip(), "/users", "GET").await.unwrap();
        let second = balancer.route(client_ip(), "/users", "GET").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(balancer.metrics().cache_hits, 1);
    }

    #[tokio::test]
    async fn failover_flushes_the_routing_cache() {
        let balancer = balancer(RoutingPolicy::Geoproximity, Arc::new(ScriptedProber::new()));
        let first = balancer.route(client_ip(), "/users", "GET").await.unwrap();
        assert_eq!(first[0], "api-use1.example.com");

        balancer.trigger_failover("us-east-1");
        let second = balancer.route(client_ip(), "/users", "GET").await.unwrap();
        assert_eq!(second, vec!["api-euw1.example.com".to_string()]);
    }

    #[tokio::test]
    async fn no_healthy_endpoints_is_an_error() {
        let balancer = balancer(RoutingPolicy::Geoproximity, Arc::new(ScriptedProber::new()));
        balancer.trigger_failover("us-east-1");
        balancer.trigger_failover("eu-west-1");
        let err = balancer.route(client_ip(), "/", "GET").await.unwrap_err();
        assert!(matches!(err, Error::NoHealthyEndpoint(_)));
    }

    #[tokio::test]
    async fn probe_cycle_flips_health_after_thresholds() {
        let prober = Arc::new(ScriptedProber::new());
        let balancer = balancer(RoutingPolicy::Geoproximity, prober.clone());
        prober.set_down("api-use1.example.com", true);

        for _ in 0..3 {
            balancer.run_probe_cycle().await;
        }
        let health = balancer.endpoint_health();
        let use1 = health.iter().find(|h| h.endpoint.contains("use1")).unwrap();
        assert!(!use1.healthy);
        assert!(use1.availability < 100.0);

        prober.set_down("api-use1.example.com", false);
        balancer.run_probe_cycle().await;
        balancer.run_probe_cycle().await;
        let health = balancer.endpoint_health();
        assert!(health.iter().find(|h| h.endpoint.contains("use1")).unwrap().healthy);
    }

    #[tokio::test]
    async fn dns_resolution_returns_literal_endpoint_addresses() {
        let regions = vec![RegionConfig {
            code: "us-east-1".into(),
            name: "N. Virginia".into(),
            latitude: 40.7,
            longitude: -74.0,
            endpoints: vec!["192.0.2.10:8443".into(), "192.0.2.11:8443".into()],
            capacity: 1000,
            cost_per_million: 1.0,
            active: true,
        }];
        let settings = BalancerSettings {
            policy: RoutingPolicy::Multivalue,
            ..BalancerSettings::default()
        };
        let balancer = GlobalBalancer::new(
            &regions,
            settings,
            Arc::new(ScriptedProber::new()),
            new_york_resolver(),
        );

        let mut addresses = balancer.resolve(client_ip()).await.unwrap();
        addresses.sort();
        assert_eq!(
            addresses,
            vec![
                "192.0.2.10".parse::<IpAddr>().unwrap(),
                "192.0.2.11".parse::<IpAddr>().unwrap()
            ]
        );
        assert_eq!(balancer.dns_ttl(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn capacity_cycle_reports_load_percentages() {
        let balancer = balancer(RoutingPolicy::Geoproximity, Arc::new(ScriptedProber::new()));
        for _ in 0..900 {
            balancer.record_dispatch("api-use1.example.com");
        }
        let report = balancer.run_capacity_cycle();
        let us = report.iter().find(|(code, _)| code == "us-east-1").unwrap();
        assert!((us.1 - 90.0).abs() < 1e-9);

        // counters reset each cycle
        let report = balancer.run_capacity_cycle();
        let us = report.iter().find(|(code, _)| code == "us-east-1").unwrap();
        assert_eq!(us.1, 0.0);
    }
}
