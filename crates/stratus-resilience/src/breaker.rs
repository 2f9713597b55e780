//! Circuit breaker with sliding-window failure detection
//!
//! State machine: CLOSED -> OPEN on threshold breach, OPEN -> HALF_OPEN once
//! the reset timeout elapses, HALF_OPEN -> CLOSED after enough consecutive
//! successes or back to OPEN on any failure. Counters reset on every
//! transition. The state lock is never held across the downstream call.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use stratus_common::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Target is failing, requests are rejected fast
    Open,
    /// Probing whether the target has recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Per-breaker tuning knobs
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures in CLOSED before opening
    pub failure_threshold: u32,
    /// Failure rate over a full window that also opens the circuit
    pub failure_rate_threshold: f64,
    /// Successes needed in HALF_OPEN to close
    pub success_threshold: u32,
    /// Recent outcomes considered for the failure rate
    pub window_size: usize,
    pub call_timeout: Duration,
    pub reset_timeout: Duration,
    pub max_jitter: Duration,
    /// Error categories that never count as breaker failures
    pub excluded_categories: Vec<String>,
    /// Ramp admission probability while half-open instead of admitting all
    pub gradual_recovery: bool,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            success_threshold: 2,
            window_size: 10,
            call_timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            max_jitter: Duration::from_secs(5),
            excluded_categories: Vec::new(),
            gradual_recovery: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    success: bool,
    duration_ms: f64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    window: VecDeque<CallRecord>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    fallback_calls: u64,
    last_failure_at: Option<DateTime<Utc>>,
    circuit_opened_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a breaker for the status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub fallback_calls: u64,
    pub failure_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_opened_at: Option<DateTime<Utc>>,
}

/// Per-target circuit breaker
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name = name.into();
        debug!(breaker = %name, "circuit breaker initialized closed");
        Self {
            name,
            settings,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                window: VecDeque::with_capacity(100),
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                fallback_calls: 0,
                last_failure_at: None,
                circuit_opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute `operation` under breaker protection.
    ///
    /// Returns the operation's value on success. Rejections surface as
    /// [`Error::BreakerOpen`]; timeouts as [`Error::DownstreamTimeout`] after
    /// the breaker has recorded them.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.should_reject() {
            let retry_after_ms = self.jittered_wait().as_millis() as u64;
            {
                let mut state = self.state.lock();
                state.rejected_calls += 1;
            }
            return Err(Error::BreakerOpen { name: self.name.clone(), retry_after_ms });
        }

        let started = Instant::now();
        match tokio::time::timeout(self.settings.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(error)) => {
                if self.is_excluded(&error) {
                    // Excluded kinds pass through without touching the
                    // failure accounting.
                    self.record_excluded(started.elapsed());
                } else {
                    self.on_failure(started.elapsed());
                }
                Err(error)
            }
            Err(_) => {
                self.on_failure(started.elapsed());
                Err(Error::DownstreamTimeout(self.settings.call_timeout.as_millis() as u64))
            }
        }
    }

    /// Like [`call`](Self::call) but runs `fallback` when the circuit rejects
    /// the request.
    pub async fn call_with_fallback<F, Fut, G, GFut, T>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        match self.call(operation).await {
            Err(Error::BreakerOpen { .. }) => {
                {
                    let mut state = self.state.lock();
                    state.fallback_calls += 1;
                }
                fallback().await
            }
            other => other,
        }
    }

    fn should_reject(&self) -> bool {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed_enough = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.settings.reset_timeout);
                if elapsed_enough {
                    info!(breaker = %self.name, "transitioning to half-open for probing");
                    state.state = CircuitState::HalfOpen;
                    state.failure_count = 0;
                    state.success_count = 0;
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                if self.settings.gradual_recovery {
                    let allow_probability =
                        (0.1 * (state.success_count + 1) as f64).min(1.0);
                    rand::thread_rng().gen::<f64>() >= allow_probability
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self, duration: Duration) {
        let mut state = self.state.lock();
        push_record(&mut state, CallRecord { success: true, duration_ms: ms(duration) });
        state.total_calls += 1;
        state.successful_calls += 1;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.settings.success_threshold {
                    info!(breaker = %self.name, "closing after successful probes");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, duration: Duration) {
        let mut state = self.state.lock();
        push_record(&mut state, CallRecord { success: false, duration_ms: ms(duration) });
        state.total_calls += 1;
        state.failed_calls += 1;
        state.last_failure_at = Some(Utc::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                let over_count = state.failure_count >= self.settings.failure_threshold;
                // The rate trigger needs a full window to be meaningful.
                let over_rate = state.window.len() >= self.settings.window_size
                    && failure_rate(&state.window, self.settings.window_size)
                        >= self.settings.failure_rate_threshold;
                if over_count || over_rate {
                    self.open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "reopening after failure during probe");
                self.open(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    fn record_excluded(&self, duration: Duration) {
        let mut state = self.state.lock();
        push_record(&mut state, CallRecord { success: true, duration_ms: ms(duration) });
        state.total_calls += 1;
        state.successful_calls += 1;
    }

    fn open(&self, state: &mut BreakerState) {
        warn!(breaker = %self.name, failures = state.failure_count, "circuit opened");
        state.state = CircuitState::Open;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = Some(Instant::now());
        state.circuit_opened_at = Some(Utc::now());
    }

    fn is_excluded(&self, error: &Error) -> bool {
        self.settings.excluded_categories.iter().any(|c| c == error.category())
    }

    fn jittered_wait(&self) -> Duration {
        let base = self.settings.reset_timeout;
        let cap = self.settings.max_jitter.min(base.mul_f64(0.1));
        if cap.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..cap.as_secs_f64());
        base + Duration::from_secs_f64(jitter)
    }

    /// Current state; reads do not serialize with mutations
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Status snapshot for the observability surface
    pub fn status(&self) -> BreakerStatus {
        let state = self.state.lock();
        let window_len = state.window.len().min(self.settings.window_size);
        let avg = if window_len > 0 {
            state
                .window
                .iter()
                .rev()
                .take(window_len)
                .map(|r| r.duration_ms)
                .sum::<f64>()
                / window_len as f64
        } else {
            0.0
        };
        BreakerStatus {
            name: self.name.clone(),
            state: state.state,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            fallback_calls: state.fallback_calls,
            failure_rate: failure_rate(&state.window, self.settings.window_size),
            avg_response_time_ms: avg,
            last_failure_at: state.last_failure_at,
            circuit_opened_at: state.circuit_opened_at,
        }
    }

    /// Manually reset to CLOSED; safe to call repeatedly
    pub fn reset(&self) {
        let mut state = self.state.lock();
        info!(breaker = %self.name, "manual reset");
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
    }

    /// Operational kill switch: force the circuit open
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        warn!(breaker = %self.name, "forced open");
        self.open(&mut state);
    }
}

fn push_record(state: &mut BreakerState, record: CallRecord) {
    if state.window.len() >= 100 {
        state.window.pop_front();
    }
    state.window.push_back(record);
}

fn failure_rate(window: &VecDeque<CallRecord>, window_size: usize) -> f64 {
    let recent: Vec<&CallRecord> = window.iter().rev().take(window_size).collect();
    if recent.is_empty() {
        return 0.0;
    }
    let failures = recent.iter().filter(|r| !r.success).count();
    failures as f64 / recent.len() as f64
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
