//! Bounded per-metric time-series buffer

use std::collections::{HashMap, VecDeque};

/// Single metric data point
#[derive(Debug, Clone)]
pub struct MetricPoint {
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    pub value: f64,
    pub labels: HashMap<String, String>,
}

/// Ring buffer of recent points with insertion-time expiry
#[derive(Debug)]
pub struct TimeSeriesBuffer {
    points: VecDeque<MetricPoint>,
    max_size: usize,
    ttl_seconds: f64,
}

impl Default for TimeSeriesBuffer {
    fn default() -> Self {
        Self::new(1000, 3600.0)
    }
}

impl TimeSeriesBuffer {
    pub fn new(max_size: usize, ttl_seconds: f64) -> Self {
        Self { points: VecDeque::with_capacity(max_size.min(64)), max_size, ttl_seconds }
    }

    /// Push a point, dropping anything expired or beyond capacity
    pub fn push(&mut self, timestamp: f64, value: f64, labels: HashMap<String, String>) {
        self.points.push_back(MetricPoint { timestamp, value, labels });
        let cutoff = timestamp - self.ttl_seconds;
        while let Some(front) = self.points.front() {
            if front.timestamp < cutoff || self.points.len() > self.max_size {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.timestamp).collect()
    }

    /// Values newer than `now - window_seconds`
    pub fn recent_values(&self, now: f64, window_seconds: f64) -> Vec<f64> {
        let cutoff = now - window_seconds;
        self.points.iter().filter(|p| p.timestamp >= cutoff).map(|p| p.value).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
