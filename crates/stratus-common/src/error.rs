//! Error types and result handling for the stratus traffic layer

use thiserror::Error;

/// Result type alias for stratus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for stratus operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Circuit breaker '{name}' is open, retry after {retry_after_ms}ms")]
    BreakerOpen { name: String, retry_after_ms: u64 },

    #[error("Downstream call timed out after {0}ms")]
    DownstreamTimeout(u64),

    #[error("Downstream error: {0}")]
    Downstream(String),

    #[error("No healthy endpoint available: {0}")]
    NoHealthyEndpoint(String),

    #[error("No healthy primary available for writes")]
    NoPrimary,

    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. }
                | Error::BreakerOpen { .. }
                | Error::DownstreamTimeout(_)
                | Error::StoreUnavailable(_)
        )
    }

    /// Get error category for metrics labels
    pub fn category(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::RateLimited { .. } => "rate_limited",
            Error::BreakerOpen { .. } => "breaker_open",
            Error::DownstreamTimeout(_) => "downstream_timeout",
            Error::Downstream(_) => "downstream_error",
            Error::NoHealthyEndpoint(_) => "no_healthy_endpoint",
            Error::NoPrimary => "no_primary",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::Cache(_) => "cache",
            Error::Routing(_) => "routing",
            Error::Consensus(_) => "consensus",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }

    /// HTTP status code this error surfaces as
    pub fn http_status(&self) -> u16 {
        match self {
            Error::RateLimited { .. } => 429,
            Error::BreakerOpen { .. } => 503,
            Error::DownstreamTimeout(_) => 504,
            Error::Downstream(_) => 502,
            Error::NoHealthyEndpoint(_) | Error::NoPrimary => 503,
            Error::InvalidRequest(_) => 400,
            Error::Unauthorized(_) => 401,
            // Auxiliary-dependency failures degrade the request, they never
            // surface as errors on their own.
            Error::StoreUnavailable(_) | Error::Cache(_) => 200,
            _ => 500,
        }
    }

    /// Retry-After value in seconds, for errors that carry one
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms } | Error::BreakerOpen { retry_after_ms, .. } => {
                Some(retry_after_ms.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }
}
