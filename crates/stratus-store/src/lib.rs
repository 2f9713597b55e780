//! Shared key-value store abstraction
//!
//! Rate limiting, cache tiers and consensus state all coordinate through a
//! shared keyspace. The [`KvStore`] trait captures the operations the rest of
//! the system needs; [`RedisStore`] is the production implementation and
//! [`MemoryStore`] backs tests and store-less single-node operation.
//!
//! Token-bucket consumption is a first-class trait operation rather than a
//! raw script escape hatch so that every implementation keeps refill and
//! decrement atomic.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use stratus_common::Result;

/// Outcome of an atomic token-bucket consumption
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    pub allowed: bool,
    /// Tokens left in the bucket after this call
    pub remaining: f64,
    /// How long until enough tokens accrue, zero when allowed
    pub retry_after_ms: u64,
}

/// Shared store operations used across the traffic layer
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value with a TTL; the entry expires on its own
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Cursor-based scan for keys matching a glob pattern.
    ///
    /// Returns the next cursor and a batch of keys; a returned cursor of zero
    /// means the scan is complete. Callers drive the loop.
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>)>;

    /// Add a member to a set, refreshing the set TTL
    async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically refill and consume from a token bucket.
    ///
    /// The bucket starts at `burst` tokens and refills continuously at `rate`
    /// tokens per second, capped at `max(burst, rate)`.
    async fn consume_tokens(
        &self,
        key: &str,
        now_ms: u64,
        rate: f64,
        burst: u32,
        cost: u32,
    ) -> Result<BucketDecision>;

    /// Drop every key in this store's keyspace
    async fn flush(&self) -> Result<()>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<()>;
}

/// Match a key against a redis-style glob pattern (`*` wildcards only)
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], k) || (!k.is_empty() && inner(p, &k[1..])),
            (Some(pc), Some(kc)) if pc == kc => inner(&p[1..], &k[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

/// Shared token-bucket math used by [`MemoryStore`] and mirrored by the
/// Redis Lua script.
pub(crate) fn refill_and_consume(
    tokens: f64,
    last_ms: u64,
    now_ms: u64,
    rate: f64,
    burst: u32,
    cost: u32,
) -> (f64, BucketDecision) {
    let capacity = (burst as f64).max(rate);
    let elapsed_ms = now_ms.saturating_sub(last_ms) as f64;
    let mut tokens = (tokens + elapsed_ms * rate / 1000.0).min(capacity);

    let cost = cost as f64;
    if tokens >= cost {
        tokens -= cost;
        (tokens, BucketDecision { allowed: true, remaining: tokens, retry_after_ms: 0 })
    } else {
        let deficit = cost - tokens;
        let retry_after_ms = (deficit * 1000.0 / rate).ceil() as u64;
        (tokens, BucketDecision { allowed: false, remaining: tokens, retry_after_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_prefixes_and_wildcards() {
        assert!(glob_match("cache:*", "cache:users:abc"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("cache:*:v1", "cache:users:v1"));
        assert!(!glob_match("cache:*", "session:abc"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact2"));
    }

    #[test]
    fn bucket_starts_at_burst_and_refills() {
        // burst of 5 admits exactly 5 immediate calls
        let mut tokens = 5.0;
        let mut admitted = 0;
        for _ in 0..15 {
            let (next, decision) = refill_and_consume(tokens, 0, 0, 10.0, 5, 1);
            tokens = next;
            if decision.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);

        // one second later ten refill tokens have accrued
        let (next, first) = refill_and_consume(tokens, 0, 1000, 10.0, 5, 1);
        assert!(first.allowed);
        tokens = next;
        let mut admitted_later = 1;
        for _ in 0..9 {
            let (next, decision) = refill_and_consume(tokens, 1000, 1000, 10.0, 5, 1);
            tokens = next;
            if decision.allowed {
                admitted_later += 1;
            }
        }
        assert_eq!(admitted_later, 10);

        // the eleventh call in the same instant is rejected
        let (_, rejected) = refill_and_consume(tokens, 1000, 1000, 10.0, 5, 1);
        assert!(!rejected.allowed);
    }

    #[test]
    fn rejection_reports_retry_after() {
        let (_, decision) = refill_and_consume(0.0, 0, 0, 10.0, 5, 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 100);
    }
}
