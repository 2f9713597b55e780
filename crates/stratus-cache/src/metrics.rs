//! Per-tier cache metrics

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one cache tier
#[derive(Default)]
pub struct TierMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    bytes_served: AtomicU64,
    bytes_stored: AtomicU64,
    errors: AtomicU64,
    latency: Mutex<(f64, u64)>,
}

/// Serializable snapshot of a tier's metrics
#[derive(Debug, Clone, Serialize)]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub invalidations: u64,
    pub bytes_served: u64,
    pub bytes_stored: u64,
    pub average_latency_ms: f64,
    pub errors: u64,
}

impl TierMetrics {
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_store(&self, bytes: u64) {
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency_ms: f64) {
        let mut latency = self.latency.lock();
        latency.1 += 1;
        latency.0 += (latency_ms - latency.0) / latency.1 as f64;
    }

    pub fn snapshot(&self) -> TierMetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        TierMetricsSnapshot {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 * 100.0 } else { 0.0 },
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            average_latency_ms: self.latency.lock().0,
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
