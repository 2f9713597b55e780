//! Health model shared by every component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health levels for components, worst first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Critical,
    Unhealthy,
    Degraded,
    Healthy,
}

impl HealthLevel {
    /// HTTP status code the overall status endpoint returns at this level
    pub fn http_status(&self) -> u16 {
        match self {
            HealthLevel::Critical => 503,
            HealthLevel::Unhealthy => 500,
            HealthLevel::Degraded | HealthLevel::Healthy => 200,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Critical => "critical",
            HealthLevel::Unhealthy => "unhealthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Healthy => "healthy",
        }
    }
}

/// Health check result for a single component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthLevel,
    pub message: String,
    pub last_check: DateTime<Utc>,
    pub latency_ms: f64,
    pub metrics: HashMap<String, f64>,
}

impl ComponentHealth {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::at_level(HealthLevel::Healthy, message)
    }

    pub fn at_level(status: HealthLevel, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            last_check: Utc::now(),
            latency_ms: 0.0,
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Aggregated health of the whole system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub message: String,
    pub components: HashMap<String, ComponentHealth>,
    pub last_check: DateTime<Utc>,
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Aggregate component levels: any critical wins, then unhealthy, then degraded
    pub fn aggregate(components: HashMap<String, ComponentHealth>, uptime_seconds: u64) -> Self {
        let (overall, message) = if components.is_empty() {
            (HealthLevel::Healthy, "no components registered".to_string())
        } else if components.values().any(|c| c.status == HealthLevel::Critical) {
            (HealthLevel::Critical, "critical components failing".to_string())
        } else if components.values().any(|c| c.status == HealthLevel::Unhealthy) {
            (HealthLevel::Unhealthy, "some components unhealthy".to_string())
        } else if components.values().any(|c| c.status == HealthLevel::Degraded) {
            (HealthLevel::Degraded, "some components degraded".to_string())
        } else {
            (HealthLevel::Healthy, "all components healthy".to_string())
        };

        Self { overall, message, components, last_check: Utc::now(), uptime_seconds }
    }
}
