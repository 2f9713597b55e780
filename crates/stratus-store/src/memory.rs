//! In-memory [`KvStore`] implementation
//!
//! Single-process stand-in for the shared store, used by tests and by
//! store-less deployments. TTLs are honoured lazily on read and during scans.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use stratus_common::Result;

use crate::{glob_match, refill_and_consume, BucketDecision, KvStore};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug)]
struct SetEntry {
    members: HashSet<String>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_ms: u64,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    sets: HashMap<String, SetEntry>,
    buckets: HashMap<String, Bucket>,
}

/// Process-local key-value store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key.to_string(),
            Entry { value: value.to_vec(), expires_at: Instant::now() + ttl },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for key in keys {
            if inner.entries.remove(key).is_some() {
                removed += 1;
            }
            inner.sets.remove(key);
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>)> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let matching: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, entry)| entry.expires_at > now && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();

        let start = cursor as usize;
        let batch: Vec<String> = matching.iter().skip(start).take(count).cloned().collect();
        let consumed = start + batch.len();
        let next_cursor = if consumed >= matching.len() { 0 } else { consumed as u64 };
        Ok((next_cursor, batch))
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let entry = inner.sets.entry(key.to_string()).or_insert_with(|| SetEntry {
            members: HashSet::new(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.members.clear();
        }
        entry.members.insert(member.to_string());
        entry.expires_at = entry.expires_at.max(now + ttl);
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        match inner.sets.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                Ok(entry.members.iter().cloned().collect())
            }
            Some(_) => {
                inner.sets.remove(key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn consume_tokens(
        &self,
        key: &str,
        now_ms: u64,
        rate: f64,
        burst: u32,
        cost: u32,
    ) -> Result<BucketDecision> {
        let mut inner = self.inner.lock();
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert(Bucket { tokens: burst as f64, last_ms: now_ms });
        let (tokens, decision) =
            refill_and_consume(bucket.tokens, bucket.last_ms, now_ms, rate, burst, cost);
        bucket.tokens = tokens;
        bucket.last_ms = now_ms;
        Ok(decision)
    }

    async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.sets.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_sees_the_write() {
        let store = MemoryStore::new();
        store.set_ex("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn expired_entries_read_as_missing() {
        let store = MemoryStore::new();
        store.set_ex("k", b"v", Duration::from_millis(0)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_pages_through_matches() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set_ex(&format!("cache:item:{i:02}"), b"x", Duration::from_secs(60))
                .await
                .unwrap();
        }
        store.set_ex("other:1", b"x", Duration::from_secs(60)).await.unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, batch) = store.scan("cache:*", cursor, 10).await.unwrap();
            seen.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
        assert!(seen.iter().all(|k| k.starts_with("cache:item:")));
    }

    #[tokio::test]
    async fn sets_collect_members() {
        let store = MemoryStore::new();
        store.sadd("tag:users", "k1", Duration::from_secs(60)).await.unwrap();
        store.sadd("tag:users", "k2", Duration::from_secs(60)).await.unwrap();
        store.sadd("tag:users", "k1", Duration::from_secs(60)).await.unwrap();
        let mut members = store.smembers("tag:users").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[tokio::test]
    async fn bucket_admissions_match_reference_model() {
        let store = MemoryStore::new();
        let mut allowed = 0;
        for _ in 0..15 {
            let decision = store.consume_tokens("user:1", 0, 10.0, 5, 1).await.unwrap();
            if decision.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);

        let mut allowed_after_refill = 0;
        for _ in 0..12 {
            let decision = store.consume_tokens("user:1", 1000, 10.0, 5, 1).await.unwrap();
            if decision.allowed {
                allowed_after_refill += 1;
            }
        }
        assert_eq!(allowed_after_refill, 10);
    }
}
