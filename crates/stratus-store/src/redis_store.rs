//! Redis-backed [`KvStore`] implementation
//!
//! Uses a multiplexed connection manager; token-bucket consumption runs as a
//! Lua script so refill and decrement stay atomic across replicas.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::debug;

use stratus_common::{Error, Result};

use crate::{BucketDecision, KvStore};

/// Atomic token-bucket script. KEYS[1] = bucket key; ARGV = now_ms, rate
/// (tokens/sec), burst, cost, ttl_ms. Returns {allowed, remaining, retry_ms}.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local capacity = math.max(burst, rate)
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then
  tokens = burst
  ts = now
end
local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * rate / 1000)
local allowed = 0
local retry = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
else
  retry = math.ceil((cost - tokens) * 1000 / rate)
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now)
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, tostring(tokens), retry}
"#;

/// Redis-backed shared store
pub struct RedisStore {
    manager: ConnectionManager,
    bucket_script: Script,
}

impl RedisStore {
    /// Connect to the given redis URL (database index selects the keyspace)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        debug!(url, "connected to shared store");
        Ok(Self { manager, bucket_script: Script::new(TOKEN_BUCKET_SCRIPT) })
    }
}

fn store_err(e: redis::RedisError) -> Error {
    Error::StoreUnavailable(e.to_string())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex(key, value, secs).await.map_err(store_err)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        conn.del(keys).await.map_err(store_err)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.manager.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok((next, keys))
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let () = conn.sadd(key, member).await.map_err(store_err)?;
        let () = conn.expire(key, ttl.as_secs().max(1) as i64).await.map_err(store_err)?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.smembers(key).await.map_err(store_err)
    }

    async fn consume_tokens(
        &self,
        key: &str,
        now_ms: u64,
        rate: f64,
        burst: u32,
        cost: u32,
    ) -> Result<BucketDecision> {
        // Keep bucket state around long enough to refill from empty twice over.
        let ttl_ms = (((burst as f64).max(rate) / rate) * 2000.0).max(60_000.0) as u64;
        let mut conn = self.manager.clone();
        let (allowed, remaining, retry_after_ms): (i64, String, u64) = self
            .bucket_script
            .key(key)
            .arg(now_ms)
            .arg(rate)
            .arg(burst)
            .arg(cost)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(BucketDecision {
            allowed: allowed == 1,
            remaining: remaining.parse().unwrap_or(0.0),
            retry_after_ms,
        })
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("FLUSHDB").query_async(&mut conn).await.map_err(store_err)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async(&mut conn).await.map_err(store_err)
    }
}
