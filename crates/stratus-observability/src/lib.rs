//! Observability spine for the stratus traffic layer
//!
//! Three tightly coupled pieces live here:
//!
//! - [`correlation`]: correlation contexts propagated through every request
//!   and spawned task, with W3C Trace Context interop.
//! - [`anomaly`]: per-metric time-series buffers with statistical and
//!   pattern detectors that emit scored alerts.
//! - [`telemetry`]: the adaptive trace sampler, metric counters and
//!   per-operation profiles that back the scrape endpoint.

pub mod anomaly;
pub mod correlation;
pub mod propagation;
pub mod telemetry;

pub use anomaly::{AlertSink, AnomalyAlert, AnomalyEngine, AnomalySeverity, AnomalyType};
pub use correlation::{current_context, with_context, CorrelationContext, CorrelationStore, RequestType};
pub use propagation::TraceParent;
pub use telemetry::{AdaptiveSampler, MetricsCollector, ProfileRegistry};
