//! Configuration model for the stratus traffic layer
//!
//! Configuration layers defaults, an optional TOML file and the documented
//! environment variables (`SERVICE_NAME`, `REDIS_URL`, `REGIONS`, ...).
//! Invalid configuration is a startup failure.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub limiter: LimiterConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub balancer: BalancerConfig,
    pub telemetry: TelemetryConfig,
    pub budget: BudgetConfig,
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub environment: String,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Bearer token required by the mutating admin endpoints
    pub admin_token: Option<String>,
    pub shutdown_grace_secs: u64,
}

/// Shared key-value store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: String,
}

/// Primary/replica database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub primary_url: String,
    pub replica_urls: Vec<String>,
    pub probe_interval_secs: u64,
    /// Lag bound applied when a request does not demand one, in seconds
    pub default_staleness_secs: f64,
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub requests_per_second: f64,
    pub burst: u32,
    /// Admit traffic when the shared store is unreachable
    pub fail_open: bool,
}

/// Circuit breaker defaults applied to every named target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub success_threshold: u32,
    pub window_size: usize,
    pub call_timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub max_jitter_ms: u64,
    /// Error categories that never count as breaker failures
    pub excluded_categories: Vec<String>,
}

/// Edge cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub enable_compression: bool,
    pub vary_headers: Vec<String>,
    /// Optional CDN purge webhook for edge-tier invalidations
    pub cdn_purge_url: Option<String>,
}

/// Global load balancer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub regions: Vec<RegionConfig>,
    pub routing_policy: RoutingPolicy,
    pub max_endpoints: usize,
    pub dns_ttl_secs: u64,
    pub geoip_db_path: Option<String>,
    pub health: HealthProbeConfig,
    /// Static per-endpoint weights for the weighted policy
    pub endpoint_weights: std::collections::HashMap<String, u32>,
    /// Ordered endpoint preference for the failover policy
    pub failover_order: Vec<String>,
}

/// Health probe settings shared by the balancer and the replica router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthProbeConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

/// A deployment region served by the balancer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub code: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub endpoints: Vec<String>,
    /// Capacity in requests per second
    pub capacity: u64,
    #[serde(default = "default_cost_per_million")]
    pub cost_per_million: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_cost_per_million() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Traffic routing policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPolicy {
    #[default]
    Geoproximity,
    Latency,
    Weighted,
    Cost,
    Failover,
    Multivalue,
}

impl std::str::FromStr for RoutingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "geoproximity" => Ok(RoutingPolicy::Geoproximity),
            "latency" => Ok(RoutingPolicy::Latency),
            "weighted" => Ok(RoutingPolicy::Weighted),
            "cost" => Ok(RoutingPolicy::Cost),
            "failover" => Ok(RoutingPolicy::Failover),
            "multivalue" => Ok(RoutingPolicy::Multivalue),
            other => Err(Error::Configuration(format!("unknown routing policy '{other}'"))),
        }
    }
}

/// Telemetry and sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub otlp_endpoint: Option<String>,
    pub jaeger_endpoint: Option<String>,
    /// Base trace sampling rate in (0, 1]
    pub sampling_rate: f64,
    pub error_sample_rate: f64,
    pub high_latency_threshold_ms: f64,
    pub high_latency_sample_rate: f64,
}

/// Per-request latency budget split
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub total_ms: u64,
    pub rate_limit_ms: u64,
    pub selection_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { name: "stratus".to_string(), environment: "development".to_string() }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            admin_token: None,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { redis_url: "redis://localhost:6379".to_string() }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            primary_url: String::new(),
            replica_urls: Vec::new(),
            probe_interval_secs: 10,
            default_staleness_secs: 5.0,
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self { requests_per_second: 100.0, burst: 50, fail_open: true }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            success_threshold: 2,
            window_size: 10,
            call_timeout_ms: 10_000,
            reset_timeout_ms: 30_000,
            max_jitter_ms: 5_000,
            excluded_categories: vec!["invalid_request".to_string()],
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            enable_compression: true,
            vary_headers: vec!["accept".to_string(), "accept-encoding".to_string()],
            cdn_purge_url: None,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            routing_policy: RoutingPolicy::default(),
            max_endpoints: 4,
            dns_ttl_secs: 60,
            geoip_db_path: None,
            health: HealthProbeConfig::default(),
            endpoint_weights: std::collections::HashMap::new(),
            failover_order: Vec::new(),
        }
    }
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            path: "/health".to_string(),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: true,
            otlp_endpoint: None,
            jaeger_endpoint: None,
            sampling_rate: 0.1,
            error_sample_rate: 1.0,
            high_latency_threshold_ms: 1000.0,
            high_latency_sample_rate: 0.5,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { total_ms: 500, rate_limit_ms: 5, selection_ms: 10 }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    Error::Configuration(format!("cannot read {}: {e}", p.display()))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| Error::Configuration(format!("invalid config file: {e}")))?
            }
            None => Config::default(),
        };
        config.overlay_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the documented environment variables on top of the current values
    fn overlay_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("SERVICE_NAME") {
            self.service.name = v;
        }
        if let Ok(v) = std::env::var("ENVIRONMENT") {
            self.service.environment = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.store.redis_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_PRIMARY_URL") {
            self.database.primary_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_REPLICA_URLS") {
            self.database.replica_urls =
                v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = std::env::var("REGIONS") {
            self.balancer.regions = serde_json::from_str(&v)
                .map_err(|e| Error::Configuration(format!("REGIONS is not a valid JSON list: {e}")))?;
        }
        if let Ok(v) = std::env::var("ROUTING_POLICY") {
            self.balancer.routing_policy = v.parse()?;
        }
        if let Ok(v) = std::env::var("ENABLE_TRACING") {
            self.telemetry.enable_tracing = parse_bool("ENABLE_TRACING", &v)?;
        }
        if let Ok(v) = std::env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("JAEGER_ENDPOINT") {
            self.telemetry.jaeger_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("SAMPLING_RATE") {
            self.telemetry.sampling_rate = v
                .parse()
                .map_err(|_| Error::Configuration(format!("SAMPLING_RATE '{v}' is not a number")))?;
        }
        if let Ok(v) = std::env::var("GEOIP_DB_PATH") {
            self.balancer.geoip_db_path = Some(v);
        }
        Ok(())
    }

    /// Validate cross-field invariants
    fn validate(&self) -> Result<()> {
        if self.telemetry.sampling_rate <= 0.0 || self.telemetry.sampling_rate > 1.0 {
            return Err(Error::Configuration(format!(
                "sampling_rate must be in (0, 1], got {}",
                self.telemetry.sampling_rate
            )));
        }
        if self.limiter.requests_per_second <= 0.0 {
            return Err(Error::Configuration("requests_per_second must be positive".into()));
        }
        if self.limiter.burst == 0 {
            return Err(Error::Configuration("burst must be at least 1".into()));
        }
        if self.breaker.window_size == 0 {
            return Err(Error::Configuration("breaker window_size must be at least 1".into()));
        }
        for region in &self.balancer.regions {
            if region.endpoints.is_empty() {
                return Err(Error::Configuration(format!(
                    "region '{}' has no endpoints",
                    region.code
                )));
            }
            if !(-90.0..=90.0).contains(&region.latitude)
                || !(-180.0..=180.0).contains(&region.longitude)
            {
                return Err(Error::Configuration(format!(
                    "region '{}' has invalid coordinates",
                    region.code
                )));
            }
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Configuration(format!("{name} '{value}' is not a boolean"))),
    }
}
