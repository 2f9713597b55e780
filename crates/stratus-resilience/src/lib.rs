//! Failure isolation primitives for the stratus traffic layer
//!
//! The [`CircuitBreaker`] gives each named downstream target three-state
//! failure isolation with jittered recovery and gradual half-open probing;
//! the [`RateLimiter`] admits traffic against token buckets held in the
//! shared store so every replica sees the same counters.

pub mod breaker;
pub mod limiter;
pub mod registry;

pub use breaker::{BreakerSettings, CircuitBreaker, CircuitState};
pub use limiter::{RateLimitDecision, RateLimiter};
pub use registry::BreakerRegistry;
