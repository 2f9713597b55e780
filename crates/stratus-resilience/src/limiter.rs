//! Distributed token-bucket rate limiter
//!
//! Buckets live in the shared store so every replica draws from the same
//! counters; refill and decrement happen atomically inside the store. The
//! limiter holds no local token state. On store failure it degrades
//! according to configuration, fail-open by default, and always records the
//! outage in its metrics.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use stratus_common::Result;
use stratus_store::KvStore;

/// Requests-per-second cap plus burst allowance for one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: f64,
    pub retry_after_ms: u64,
    /// Set when the store was unreachable and policy decided the outcome
    pub degraded: bool,
}

/// Counters for the observability surface
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub allowed: u64,
    pub rejected: u64,
    pub store_errors: u64,
    pub fail_open: bool,
}

/// Shared-store token-bucket limiter
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    default_limit: RateLimit,
    endpoint_overrides: HashMap<String, RateLimit>,
    fail_open: bool,
    allowed: AtomicU64,
    rejected: AtomicU64,
    store_errors: AtomicU64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, default_limit: RateLimit, fail_open: bool) -> Self {
        Self {
            store,
            default_limit,
            endpoint_overrides: HashMap::new(),
            fail_open,
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    /// Install a per-endpoint override; it composes with the caller bucket
    /// via least-permissive
    pub fn with_endpoint_override(mut self, endpoint: impl Into<String>, limit: RateLimit) -> Self {
        self.endpoint_overrides.insert(endpoint.into(), limit);
        self
    }

    /// Check whether `caller` may proceed, optionally against an endpoint
    /// override. Caller identity is supplied by the façade; the limiter never
    /// infers it.
    pub async fn check(&self, caller: &str, endpoint: Option<&str>) -> RateLimitDecision {
        let now_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        self.check_at(caller, endpoint, now_ms).await
    }

    /// Clock-explicit variant used by tests and replayable tooling
    pub async fn check_at(
        &self,
        caller: &str,
        endpoint: Option<&str>,
        now_ms: u64,
    ) -> RateLimitDecision {
        let caller_key = format!("ratelimit:{caller}");
        let mut decision =
            match self.consume(&caller_key, self.default_limit, now_ms).await {
                Ok(decision) => decision,
                Err(error) => return self.degrade(error),
            };

        // Both the caller bucket and the endpoint bucket must admit.
        if let Some(limit) = endpoint.and_then(|e| self.endpoint_overrides.get(e)) {
            let endpoint_key = format!("ratelimit:{caller}:{}", endpoint.unwrap_or_default());
            match self.consume(&endpoint_key, *limit, now_ms).await {
                Ok(endpoint_decision) => {
                    decision = RateLimitDecision {
                        allowed: decision.allowed && endpoint_decision.allowed,
                        remaining: decision.remaining.min(endpoint_decision.remaining),
                        retry_after_ms: decision
                            .retry_after_ms
                            .max(endpoint_decision.retry_after_ms),
                        degraded: false,
                    };
                }
                Err(error) => return self.degrade(error),
            }
        }

        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    async fn consume(
        &self,
        key: &str,
        limit: RateLimit,
        now_ms: u64,
    ) -> Result<RateLimitDecision> {
        let bucket = self
            .store
            .consume_tokens(key, now_ms, limit.requests_per_second, limit.burst, 1)
            .await?;
        Ok(RateLimitDecision {
            allowed: bucket.allowed,
            remaining: bucket.remaining,
            retry_after_ms: bucket.retry_after_ms,
            degraded: false,
        })
    }

    fn degrade(&self, error: stratus_common::Error) -> RateLimitDecision {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        warn!(fail_open = self.fail_open, "rate-limit store unavailable: {error}");
        if self.fail_open {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            RateLimitDecision { allowed: true, remaining: 0.0, retry_after_ms: 0, degraded: true }
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            RateLimitDecision {
                allowed: false,
                remaining: 0.0,
                retry_after_ms: 1000,
                degraded: true,
            }
        }
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            fail_open: self.fail_open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use failing_store::FailingStore;
    use stratus_store::MemoryStore;

    fn limiter(rps: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            RateLimit { requests_per_second: rps, burst },
            true,
        )
    }

    #[tokio::test]
    async fn burst_admits_then_rejects() {
        let limiter = limiter(10.0, 5);
        let mut allowed = 0;
        let mut rejected = 0;
        for _ in 0..15 {
            let decision = limiter.check_at("user:1", None, 0).await;
            if decision.allowed {
                allowed += 1;
            } else {
                rejected += 1;
                assert!(decision.retry_after_ms > 0);
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(rejected, 10);

        // a second of refill admits ten more
        let mut allowed_later = 0;
        for _ in 0..10 {
            if limiter.check_at("user:1", None, 1000).await.allowed {
                allowed_later += 1;
            }
        }
        assert_eq!(allowed_later, 10);
    }

    #[tokio::test]
    async fn callers_have_independent_buckets() {
        let limiter = limiter(10.0, 1);
        assert!(limiter.check_at("user:a", None, 0).await.allowed);
        assert!(!limiter.check_at("user:a", None, 0).await.allowed);
        assert!(limiter.check_at("user:b", None, 0).await.allowed);
    }

    #[tokio::test]
    async fn endpoint_override_is_least_permissive() {
        let limiter = limiter(100.0, 50).with_endpoint_override(
            "/v1/expensive",
            RateLimit { requests_per_second: 1.0, burst: 2 },
        );

        let mut allowed = 0;
        for _ in 0..5 {
            if limiter.check_at("user:1", Some("/v1/expensive"), 0).await.allowed {
                allowed += 1;
            }
        }
        // the endpoint bucket caps admissions despite a generous caller bucket
        assert_eq!(allowed, 2);

        // other endpoints are unaffected
        assert!(limiter.check_at("user:1", Some("/v1/cheap"), 0).await.allowed);
    }

    #[tokio::test]
    async fn store_outage_fails_open_by_default() {
        let limiter = RateLimiter::new(
            Arc::new(FailingStore),
            RateLimit { requests_per_second: 1.0, burst: 1 },
            true,
        );
        let decision = limiter.check_at("user:1", None, 0).await;
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(limiter.stats().store_errors, 1);
    }

    #[tokio::test]
    async fn store_outage_can_fail_closed() {
        let limiter = RateLimiter::new(
            Arc::new(FailingStore),
            RateLimit { requests_per_second: 1.0, burst: 1 },
            false,
        );
        let decision = limiter.check_at("user:1", None, 0).await;
        assert!(!decision.allowed);
        assert!(decision.degraded);
    }

    mod failing_store {
        use async_trait::async_trait;
        use std::time::Duration;
        use stratus_common::{Error, Result};
        use stratus_store::{BucketDecision, KvStore};

        /// Store that refuses every operation
        pub struct FailingStore;

        #[async_trait]
        impl KvStore for FailingStore {
            async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn set_ex(&self, _: &str, _: &[u8], _: Duration) -> Result<()> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn del(&self, _: &[String]) -> Result<u64> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn scan(&self, _: &str, _: u64, _: usize) -> Result<(u64, Vec<String>)> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn sadd(&self, _: &str, _: &str, _: Duration) -> Result<()> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn smembers(&self, _: &str) -> Result<Vec<String>> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn consume_tokens(
                &self,
                _: &str,
                _: u64,
                _: f64,
                _: u32,
                _: u32,
            ) -> Result<BucketDecision> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn flush(&self) -> Result<()> {
                Err(Error::StoreUnavailable("down".into()))
            }
            async fn ping(&self) -> Result<()> {
                Err(Error::StoreUnavailable("down".into()))
            }
        }
    }
}
