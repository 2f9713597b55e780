//! Real-time anomaly detection
//!
//! Metrics are recorded into bounded per-metric buffers and classified by
//! name into latency, error-rate or traffic categories. Each category runs a
//! fixed set of detectors over the buffer; an alert is emitted when at least
//! two methods agree or a single method is emphatic, subject to a per-metric
//! cooldown.

pub mod buffer;
pub mod detectors;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

use crate::correlation;
use buffer::TimeSeriesBuffer;

/// Types of anomalies that can be detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    LatencySpike,
    ErrorRateSpike,
    TrafficAnomaly,
    ResourceExhaustion,
    PerformanceDegradation,
    UnusualPattern,
}

/// Severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// An emitted anomaly alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub id: String,
    pub kind: AnomalyType,
    pub severity: AnomalySeverity,
    pub title: String,
    pub description: String,
    pub metric_name: String,
    pub current_value: f64,
    pub expected_value: f64,
    pub threshold: f64,
    pub confidence: f64,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub detection_methods: Vec<String>,
}

/// Summary statistics for a metric over a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub latest: f64,
    pub window_seconds: f64,
}

/// Receives every emitted alert; implementations must not block the caller
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &AnomalyAlert);
}

/// Ships alerts as JSON to a webhook URL
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self { client: reqwest::Client::new(), url }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, alert: &AnomalyAlert) {
        let result = self.client.post(&self.url).json(alert).send().await;
        if let Err(e) = result {
            error!(alert_id = %alert.id, "alert webhook delivery failed: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MetricCategory {
    Latency,
    ErrorRate,
    Traffic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    ZScore,
    ModifiedZScore,
    Iqr,
    ExponentialSmoothing,
    SuddenChange,
    Trend,
}

impl Method {
    fn name(&self) -> &'static str {
        match self {
            Method::ZScore => "z_score",
            Method::ModifiedZScore => "modified_z_score",
            Method::Iqr => "iqr",
            Method::ExponentialSmoothing => "exponential_smoothing",
            Method::SuddenChange => "sudden_change",
            Method::Trend => "trend",
        }
    }
}

impl MetricCategory {
    fn classify(metric_name: &str) -> Self {
        let lower = metric_name.to_ascii_lowercase();
        if lower.contains("latency") || lower.contains("response_time") {
            MetricCategory::Latency
        } else if lower.contains("error") || lower.contains("failure") {
            MetricCategory::ErrorRate
        } else if lower.contains("traffic") || lower.contains("requests") {
            MetricCategory::Traffic
        } else {
            MetricCategory::Latency
        }
    }

    fn methods(&self) -> &'static [Method] {
        match self {
            MetricCategory::Latency => {
                &[Method::ZScore, Method::Iqr, Method::ExponentialSmoothing]
            }
            MetricCategory::ErrorRate => &[Method::ZScore, Method::SuddenChange],
            MetricCategory::Traffic => &[Method::Iqr, Method::Trend],
        }
    }

    fn min_samples(&self) -> usize {
        match self {
            MetricCategory::Latency | MetricCategory::Traffic => 10,
            MetricCategory::ErrorRate => 5,
        }
    }

    fn anomaly_type(&self) -> AnomalyType {
        match self {
            MetricCategory::Latency => AnomalyType::LatencySpike,
            MetricCategory::ErrorRate => AnomalyType::ErrorRateSpike,
            MetricCategory::Traffic => AnomalyType::TrafficAnomaly,
        }
    }

    /// Error-rate alerts escalate at lower confidence than the others
    fn severity(&self, confidence: f64) -> AnomalySeverity {
        let (critical, high, medium) = match self {
            MetricCategory::ErrorRate => (10.0, 5.0, 3.0),
            _ => (8.0, 5.0, 3.0),
        };
        if confidence > critical {
            AnomalySeverity::Critical
        } else if confidence > high {
            AnomalySeverity::High
        } else if confidence > medium {
            AnomalySeverity::Medium
        } else {
            AnomalySeverity::Low
        }
    }

    fn label(&self) -> &'static str {
        match self {
            MetricCategory::Latency => "latency",
            MetricCategory::ErrorRate => "error_rate",
            MetricCategory::Traffic => "traffic",
        }
    }
}

const ALERT_COOLDOWN: Duration = Duration::from_secs(300);
const ALERT_HISTORY_CAPACITY: usize = 1000;

struct EngineState {
    buffers: HashMap<String, TimeSeriesBuffer>,
    cooldowns: HashMap<(String, MetricCategory), Instant>,
}

/// Main anomaly detection engine
pub struct AnomalyEngine {
    state: Mutex<EngineState>,
    history: Mutex<VecDeque<AnomalyAlert>>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
}

impl Default for AnomalyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                buffers: HashMap::new(),
                cooldowns: HashMap::new(),
            }),
            history: Mutex::new(VecDeque::with_capacity(ALERT_HISTORY_CAPACITY)),
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.write().push(sink);
    }

    /// Record a metric value and run detection synchronously.
    ///
    /// Detection is O(buffer length) with the buffer capped at 1000 points,
    /// so recording stays cheap enough for the request path.
    pub fn record(&self, metric_name: &str, value: f64, labels: Option<HashMap<String, String>>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.record_at(metric_name, value, labels, now);
    }

    /// Record with an explicit timestamp (seconds since the epoch)
    pub fn record_at(
        &self,
        metric_name: &str,
        value: f64,
        labels: Option<HashMap<String, String>>,
        timestamp: f64,
    ) {
        let category = MetricCategory::classify(metric_name);

        let alert = {
            let mut state = self.state.lock();
            let buffer = state.buffers.entry(metric_name.to_string()).or_default();
            buffer.push(timestamp, value, labels.unwrap_or_default());

            if buffer.len() < category.min_samples() {
                None
            } else {
                let values = buffer.values();
                let timestamps = buffer.timestamps();
                let detections: Vec<(Method, f64)> = category
                    .methods()
                    .iter()
                    .filter_map(|method| {
                        let confidence = match method {
                            Method::ZScore => detectors::z_score(&values),
                            Method::ModifiedZScore => detectors::modified_z_score(&values),
                            Method::Iqr => detectors::iqr(&values),
                            Method::ExponentialSmoothing => {
                                detectors::exponential_smoothing(&values)
                            }
                            Method::SuddenChange => detectors::sudden_change(&values),
                            Method::Trend => detectors::trend(&values, &timestamps),
                        };
                        confidence.map(|c| (*method, c))
                    })
                    .collect();

                let emphatic = detections.iter().any(|(_, c)| *c > 5.0);
                if detections.len() >= 2 || (emphatic && !detections.is_empty()) {
                    self.build_alert(&mut state, metric_name, category, value, &values, detections)
                } else {
                    None
                }
            }
        };

        if let Some(alert) = alert {
            self.emit(alert);
        }
    }

    fn build_alert(
        &self,
        state: &mut EngineState,
        metric_name: &str,
        category: MetricCategory,
        current_value: f64,
        values: &[f64],
        detections: Vec<(Method, f64)>,
    ) -> Option<AnomalyAlert> {
        let cooldown_key = (metric_name.to_string(), category);
        if let Some(last) = state.cooldowns.get(&cooldown_key) {
            if last.elapsed() < ALERT_COOLDOWN {
                debug!(metric = metric_name, "anomaly suppressed by cooldown");
                return None;
            }
        }
        state.cooldowns.insert(cooldown_key, Instant::now());

        let max_confidence =
            detections.iter().map(|(_, c)| *c).fold(f64::MIN, f64::max);
        let expected = detectors::mean(&values[..values.len() - 1]);
        let methods: Vec<String> =
            detections.iter().map(|(m, _)| m.name().to_string()).collect();
        let context = correlation::current_context();

        let epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        Some(AnomalyAlert {
            id: format!("anomaly_{epoch}_{metric_name}"),
            kind: category.anomaly_type(),
            severity: category.severity(max_confidence),
            title: format!("Anomaly detected in {metric_name}"),
            description: format!(
                "Current value {current_value:.2} deviates from expected {expected:.2}; \
                 detected by {}",
                methods.join(", ")
            ),
            metric_name: metric_name.to_string(),
            current_value,
            expected_value: expected,
            threshold: max_confidence,
            confidence: max_confidence,
            correlation_id: context.as_ref().map(|c| c.correlation_id.clone()),
            trace_id: context.as_ref().map(|c| c.trace_id.clone()),
            detected_at: Utc::now(),
            detection_methods: methods,
        })
    }

    fn emit(&self, alert: AnomalyAlert) {
        warn!(
            alert_id = %alert.id,
            metric = %alert.metric_name,
            severity = ?alert.severity,
            confidence = alert.confidence,
            "anomaly detected"
        );

        {
            let mut history = self.history.lock();
            if history.len() >= ALERT_HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        let sinks: Vec<Arc<dyn AlertSink>> = self.sinks.read().clone();
        if sinks.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for sink in sinks {
                    sink.deliver(&alert).await;
                }
            });
        }
    }

    /// Recent alerts, newest last, optionally filtered
    pub fn alerts(
        &self,
        since: Option<DateTime<Utc>>,
        min_severity: Option<AnomalySeverity>,
        limit: usize,
    ) -> Vec<AnomalyAlert> {
        let history = self.history.lock();
        history
            .iter()
            .filter(|alert| since.map_or(true, |s| alert.detected_at >= s))
            .filter(|alert| min_severity.map_or(true, |s| alert.severity >= s))
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Summary statistics for a metric over the trailing window
    pub fn summary(&self, metric_name: &str, window_seconds: f64) -> Option<MetricSummary> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let state = self.state.lock();
        let buffer = state.buffers.get(metric_name)?;
        let values = buffer.recent_values(now, window_seconds);
        if values.is_empty() {
            return None;
        }

        let mean = detectors::mean(&values);
        Some(MetricSummary {
            count: values.len(),
            mean,
            median: detectors::median(&values),
            min: values.iter().cloned().fold(f64::INFINITY, f64::min),
            max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            std_dev: detectors::stdev(&values, mean),
            latest: *values.last().unwrap(),
            window_seconds,
        })
    }

    /// Names of every metric currently buffered
    pub fn metric_names(&self) -> Vec<String> {
        self.state.lock().buffers.keys().cloned().collect()
    }
}
