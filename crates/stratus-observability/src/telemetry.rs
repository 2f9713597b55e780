//! Adaptive sampling, metric counters and operation profiles

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Head-based adaptive trace sampler.
///
/// Keeps every child of a sampled parent, samples errors and slow operations
/// at elevated rates, and falls back to deterministic trace-id modulo
/// sampling otherwise. A decision, once made for a trace, is final.
pub struct AdaptiveSampler {
    base_rate: f64,
    error_rate: f64,
    high_latency_threshold_ms: f64,
    high_latency_rate: f64,
    decisions: Mutex<DecisionCache>,
}

struct DecisionCache {
    map: HashMap<u64, bool>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl AdaptiveSampler {
    pub fn new(
        base_rate: f64,
        error_rate: f64,
        high_latency_threshold_ms: f64,
        high_latency_rate: f64,
    ) -> Self {
        Self {
            base_rate: base_rate.clamp(f64::MIN_POSITIVE, 1.0),
            error_rate: error_rate.clamp(f64::MIN_POSITIVE, 1.0),
            high_latency_threshold_ms,
            high_latency_rate: high_latency_rate.clamp(f64::MIN_POSITIVE, 1.0),
            decisions: Mutex::new(DecisionCache {
                map: HashMap::new(),
                order: VecDeque::new(),
                capacity: 10_000,
            }),
        }
    }

    /// Decide whether to keep a trace. `trace_id_low` is the low 64 bits of
    /// the trace id, used for deterministic modulo sampling.
    pub fn should_sample(
        &self,
        parent_sampled: bool,
        trace_id_low: u64,
        is_error: bool,
        latency_ms: Option<f64>,
    ) -> bool {
        if parent_sampled {
            self.remember(trace_id_low, true);
            return true;
        }

        if let Some(existing) = self.decisions.lock().map.get(&trace_id_low) {
            return *existing;
        }

        let decision = if is_error {
            modulo_keep(trace_id_low, self.error_rate)
        } else if latency_ms.is_some_and(|l| l > self.high_latency_threshold_ms) {
            modulo_keep(trace_id_low, self.high_latency_rate)
        } else {
            modulo_keep(trace_id_low, self.base_rate)
        };
        self.remember(trace_id_low, decision);
        decision
    }

    /// Parse the low 64 bits out of a 32-hex-char trace id
    pub fn trace_id_low(trace_id: &str) -> u64 {
        trace_id
            .get(16..32)
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .unwrap_or(0)
    }

    fn remember(&self, trace_id_low: u64, decision: bool) {
        let mut cache = self.decisions.lock();
        if cache.map.len() >= cache.capacity {
            if let Some(evicted) = cache.order.pop_front() {
                cache.map.remove(&evicted);
            }
        }
        if cache.map.insert(trace_id_low, decision).is_none() {
            cache.order.push_back(trace_id_low);
        }
    }
}

fn modulo_keep(trace_id_low: u64, rate: f64) -> bool {
    let modulus = (1.0 / rate).round().max(1.0) as u64;
    trace_id_low % modulus == 0
}

/// A single exported metric value
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
}

/// Process-wide metric registry backing the Prometheus text endpoint.
///
/// Labels are folded into the series key the way the exposition format
/// renders them, so the scrape handler can emit entries verbatim.
#[derive(Default)]
pub struct MetricsCollector {
    series: Mutex<HashMap<String, MetricValue>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_counter(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = series_key(name, labels);
        let mut series = self.series.lock();
        match series.entry(key).or_insert(MetricValue::Counter(0.0)) {
            MetricValue::Counter(value) | MetricValue::Gauge(value) => *value += delta,
        }
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(name, labels);
        self.series.lock().insert(key, MetricValue::Gauge(value));
    }

    /// Snapshot of all series, sorted by key for stable output
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let series = self.series.lock();
        let mut out: Vec<(String, f64)> = series
            .iter()
            .map(|(key, value)| {
                let v = match value {
                    MetricValue::Counter(v) | MetricValue::Gauge(v) => *v,
                };
                (key.clone(), v)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<&(&str, &str)> = labels.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let rendered: Vec<String> =
        sorted.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

/// Aggregate timing profile for one operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationProfile {
    pub count: u64,
    pub errors: u64,
    pub total_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

/// Per-operation duration profiles for the public operations of each
/// component, recorded by the coordinator around every call.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: Mutex<HashMap<String, OperationProfile>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        let elapsed_ms = duration.as_secs_f64() * 1000.0;
        let mut profiles = self.profiles.lock();
        let profile = profiles.entry(operation.to_string()).or_insert(OperationProfile {
            count: 0,
            errors: 0,
            total_ms: 0.0,
            max_ms: 0.0,
            mean_ms: 0.0,
        });
        profile.count += 1;
        if !success {
            profile.errors += 1;
        }
        profile.total_ms += elapsed_ms;
        profile.max_ms = profile.max_ms.max(elapsed_ms);
        profile.mean_ms = profile.total_ms / profile.count as f64;
    }

    pub fn snapshot(&self) -> HashMap<String, OperationProfile> {
        self.profiles.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_sampled_is_always_kept() {
        let sampler = AdaptiveSampler::new(0.000_001, 0.000_001, 1000.0, 0.000_001);
        assert!(sampler.should_sample(true, 12345, false, None));
    }

    #[test]
    fn errors_sample_at_elevated_rate() {
        let sampler = AdaptiveSampler::new(0.0001, 1.0, 1000.0, 0.5);
        // error rate 1.0 keeps every trace regardless of id
        assert!(sampler.should_sample(false, 7, true, None));
        assert!(sampler.should_sample(false, 1_000_003, true, None));
    }

    #[test]
    fn base_rate_uses_trace_id_modulo() {
        let sampler = AdaptiveSampler::new(0.1, 1.0, 1000.0, 0.5);
        assert!(sampler.should_sample(false, 20, false, None));
        assert!(!sampler.should_sample(false, 21, false, None));
    }

    #[test]
    fn decisions_are_sticky_per_trace() {
        let sampler = AdaptiveSampler::new(0.1, 1.0, 1000.0, 0.5);
        // first decision for trace 21 is a drop; an error seen later in the
        // same trace does not flip it
        assert!(!sampler.should_sample(false, 21, false, None));
        assert!(!sampler.should_sample(false, 21, true, None));
    }

    #[test]
    fn high_latency_samples_at_elevated_rate() {
        let sampler = AdaptiveSampler::new(0.000_001, 1.0, 1000.0, 1.0);
        assert!(sampler.should_sample(false, 33, false, Some(2500.0)));
    }

    #[test]
    fn trace_id_low_parses_hex_tail() {
        assert_eq!(AdaptiveSampler::trace_id_low("00000000000000000000000000000014"), 20);
        assert_eq!(AdaptiveSampler::trace_id_low("bogus"), 0);
    }

    #[test]
    fn collector_renders_label_sets() {
        let collector = MetricsCollector::new();
        collector.incr_counter("requests_total", &[("status", "200")], 1.0);
        collector.incr_counter("requests_total", &[("status", "200")], 2.0);
        collector.set_gauge("replicas_healthy", &[], 3.0);

        let snapshot = collector.snapshot();
        assert!(snapshot
            .iter()
            .any(|(k, v)| k == "requests_total{status=\"200\"}" && *v == 3.0));
        assert!(snapshot.iter().any(|(k, v)| k == "replicas_healthy" && *v == 3.0));
    }

    #[test]
    fn profiles_track_mean_and_max() {
        let registry = ProfileRegistry::new();
        registry.record("breaker.call", Duration::from_millis(10), true);
        registry.record("breaker.call", Duration::from_millis(30), false);

        let snapshot = registry.snapshot();
        let profile = &snapshot["breaker.call"];
        assert_eq!(profile.count, 2);
        assert_eq!(profile.errors, 1);
        assert!((profile.mean_ms - 20.0).abs() < 1.0);
        assert!(profile.max_ms >= 30.0);
    }
}
