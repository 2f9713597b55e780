//! Multi-tier edge cache
//!
//! Three tiers (edge, regional, origin) back onto shared-store keyspaces.
//! Misses in an upper tier probe the lower tiers and promote hits upward;
//! expired entries can be served stale while a background task revalidates
//! direct-to-origin and writes through. Invalidation supports exact, prefix,
//! tag, pattern and global scopes, with CDN purge fan-out for edge-tier
//! exact/prefix invalidations.

pub mod cdn;
pub mod entry;
pub mod metrics;

pub use cdn::{CdnPurger, WebhookPurger};
pub use entry::{compute_etag, derive_key, CacheEntry};
pub use metrics::{TierMetrics, TierMetricsSnapshot};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use stratus_common::Result;
use stratus_store::KvStore;

/// Cache tier levels, closest to the user first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Edge,
    Regional,
    Origin,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Edge => "edge",
            CacheTier::Regional => "regional",
            CacheTier::Origin => "origin",
        }
    }

    pub fn all() -> [CacheTier; 3] {
        [CacheTier::Edge, CacheTier::Regional, CacheTier::Origin]
    }

    /// Tiers further from the user than this one
    fn lower(&self) -> &'static [CacheTier] {
        match self {
            CacheTier::Edge => &[CacheTier::Regional, CacheTier::Origin],
            CacheTier::Regional => &[CacheTier::Origin],
            CacheTier::Origin => &[],
        }
    }
}

/// Caching strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Try cache first, fall back to origin
    CacheFirst,
    /// Serve only from cache, never probe lower tiers
    CacheOnly,
    /// Try origin first, cache the response
    NetworkFirst,
    /// Always fetch from origin
    NetworkOnly,
    /// Serve expired entries immediately and refresh in the background
    StaleWhileRevalidate,
}

/// Cache invalidation scopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum InvalidationScope {
    Exact(String),
    Prefix(String),
    Tag(String),
    Pattern(String),
    Global,
}

/// Response from the origin during revalidation or warm-up
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub body: Vec<u8>,
    pub content_type: String,
    pub headers: HashMap<String, String>,
}

/// Fetches fresh content for stale-while-revalidate and cache warming
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<OriginResponse>;
}

/// Plain HTTPS origin client
pub struct HttpOrigin {
    client: reqwest::Client,
}

impl HttpOrigin {
    pub fn new(timeout: Duration) -> Self {
        let client =
            reqwest::Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, source: &str) -> Result<OriginResponse> {
        let response = self
            .client
            .get(source)
            .send()
            .await
            .map_err(|e| stratus_common::Error::Downstream(e.to_string()))?;
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| stratus_common::Error::Downstream(e.to_string()))?
            .to_vec();
        Ok(OriginResponse { body, content_type, headers })
    }
}

/// How long stale entries stay retrievable past expiry for SWR serving
const STALE_GRACE: Duration = Duration::from_secs(60);

/// Multi-tier edge cache over shared-store keyspaces
pub struct EdgeCache {
    stores: HashMap<CacheTier, Arc<dyn KvStore>>,
    origin: Option<Arc<dyn Origin>>,
    cdn: Option<Arc<dyn CdnPurger>>,
    default_ttl: Duration,
    enable_compression: bool,
    metrics: HashMap<CacheTier, Arc<TierMetrics>>,
}

impl EdgeCache {
    pub fn new(
        edge: Arc<dyn KvStore>,
        regional: Arc<dyn KvStore>,
        origin_store: Arc<dyn KvStore>,
        default_ttl: Duration,
        enable_compression: bool,
    ) -> Self {
        let mut stores: HashMap<CacheTier, Arc<dyn KvStore>> = HashMap::new();
        stores.insert(CacheTier::Edge, edge);
        stores.insert(CacheTier::Regional, regional);
        stores.insert(CacheTier::Origin, origin_store);

        let metrics =
            CacheTier::all().into_iter().map(|t| (t, Arc::new(TierMetrics::default()))).collect();

        Self { stores, origin: None, cdn: None, default_ttl, enable_compression, metrics }
    }

    pub fn with_origin(mut self, origin: Arc<dyn Origin>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_cdn(mut self, cdn: Arc<dyn CdnPurger>) -> Self {
        self.cdn = Some(cdn);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get an entry, probing lower tiers and promoting on hit
    pub async fn get(
        &self,
        key: &str,
        tier: CacheTier,
        strategy: CacheStrategy,
    ) -> Option<CacheEntry> {
        if strategy == CacheStrategy::NetworkOnly {
            return None;
        }

        if let Some(entry) = self.probe_tier(key, tier, strategy).await {
            return Some(entry);
        }

        if strategy == CacheStrategy::CacheOnly {
            return None;
        }

        for lower in tier.lower() {
            if let Some(entry) = self.probe_tier(key, *lower, strategy).await {
                // Promote into every tier between the requested one and the
                // hit, so the next request short-circuits.
                let mut promote_to = tier;
                loop {
                    if self.set(key, entry.clone(), promote_to).await.is_ok() {
                        debug!(key, tier = promote_to.as_str(), "promoted cache entry");
                    }
                    match promote_to {
                        CacheTier::Edge if *lower != CacheTier::Regional => {
                            promote_to = CacheTier::Regional;
                        }
                        _ => break,
                    }
                }
                return Some(entry);
            }
        }

        None
    }

    async fn probe_tier(
        &self,
        key: &str,
        tier: CacheTier,
        strategy: CacheStrategy,
    ) -> Option<CacheEntry> {
        let store = self.stores.get(&tier)?;
        let tier_metrics = self.metrics.get(&tier)?.clone();
        let started = Instant::now();

        let raw = match store.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                // A store outage degrades to a miss; the request proceeds to
                // origin without caching.
                warn!(tier = tier.as_str(), "cache store unavailable: {e}");
                tier_metrics.record_error();
                return None;
            }
        };

        let Some(raw) = raw else {
            tier_metrics.record_miss();
            return None;
        };

        let mut entry = match CacheEntry::from_bytes(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                error!(key, tier = tier.as_str(), "undecodable cache entry: {e}");
                tier_metrics.record_error();
                let _ = store.del(std::slice::from_ref(&key.to_string())).await;
                return None;
            }
        };

        let now = Utc::now();
        if entry.is_expired(now) {
            if strategy == CacheStrategy::StaleWhileRevalidate {
                self.spawn_revalidation(&entry, tier);
                tier_metrics.record_hit(entry.size_bytes as u64);
                tier_metrics.record_latency(started.elapsed().as_secs_f64() * 1000.0);
                return Some(entry);
            }
            let _ = store.del(std::slice::from_ref(&key.to_string())).await;
            tier_metrics.record_eviction(1);
            tier_metrics.record_miss();
            return None;
        }

        entry.hit_count += 1;
        entry.last_accessed = now;
        tier_metrics.record_hit(entry.size_bytes as u64);
        tier_metrics.record_latency(started.elapsed().as_secs_f64() * 1000.0);

        // Write back the touched stats without holding up the read path.
        if let Ok(bytes) = entry.to_bytes() {
            let store = store.clone();
            let key = key.to_string();
            let remaining = (entry.expires_at - now).num_seconds().max(1) as u64;
            tokio::spawn(async move {
                let ttl = Duration::from_secs(remaining) + STALE_GRACE;
                let _ = store.set_ex(&key, &bytes, ttl).await;
            });
        }

        Some(entry)
    }

    /// Store an entry in a tier; tags are indexed for group invalidation
    pub async fn set(&self, key: &str, mut entry: CacheEntry, tier: CacheTier) -> Result<bool> {
        let store = match self.stores.get(&tier) {
            Some(store) => store,
            None => return Ok(false),
        };
        let tier_metrics = &self.metrics[&tier];

        if self.enable_compression {
            entry.maybe_compress();
        }

        let now = Utc::now();
        let remaining = (entry.expires_at - now).num_seconds();
        if remaining <= 0 {
            return Ok(false);
        }
        let ttl = Duration::from_secs(remaining as u64) + STALE_GRACE;

        let bytes = entry.to_bytes()?;
        match store.set_ex(key, &bytes, ttl).await {
            Ok(()) => {
                tier_metrics.record_store(entry.size_bytes as u64);
                for tag in &entry.tags {
                    if let Err(e) = store.sadd(&format!("tag:{tag}"), key, ttl).await {
                        warn!(tag, "tag index update failed: {e}");
                    }
                }
                Ok(true)
            }
            Err(e) => {
                tier_metrics.record_error();
                warn!(key, tier = tier.as_str(), "cache set failed: {e}");
                Err(e)
            }
        }
    }

    /// Delete a key from the given tier, or all tiers
    pub async fn delete(&self, key: &str, tier: Option<CacheTier>) {
        let tiers: Vec<CacheTier> = match tier {
            Some(tier) => vec![tier],
            None => CacheTier::all().to_vec(),
        };
        for tier in tiers {
            if let Some(store) = self.stores.get(&tier) {
                match store.del(std::slice::from_ref(&key.to_string())).await {
                    Ok(n) if n > 0 => self.metrics[&tier].record_eviction(n),
                    Ok(_) => {}
                    Err(e) => {
                        self.metrics[&tier].record_error();
                        warn!(key, tier = tier.as_str(), "cache delete failed: {e}");
                    }
                }
            }
        }
    }

    /// Invalidate entries by scope; returns how many keys were removed
    pub async fn invalidate(
        &self,
        scope: InvalidationScope,
        tier: Option<CacheTier>,
    ) -> Result<u64> {
        let tiers: Vec<CacheTier> = match tier {
            Some(tier) => vec![tier],
            None => CacheTier::all().to_vec(),
        };

        let mut removed_total = 0;
        for tier in &tiers {
            let Some(store) = self.stores.get(tier) else { continue };
            let tier_metrics = &self.metrics[tier];

            let result: Result<u64> = async {
                match &scope {
                    InvalidationScope::Exact(key) => {
                        store.del(std::slice::from_ref(key)).await
                    }
                    InvalidationScope::Prefix(prefix) => {
                        self.scan_and_delete(store.as_ref(), &format!("{prefix}*")).await
                    }
                    InvalidationScope::Pattern(pattern) => {
                        self.scan_and_delete(store.as_ref(), pattern).await
                    }
                    InvalidationScope::Tag(tag) => {
                        let tag_key = format!("tag:{tag}");
                        let members = store.smembers(&tag_key).await?;
                        let mut removed = store.del(&members).await?;
                        removed += store.del(std::slice::from_ref(&tag_key)).await?;
                        Ok(removed)
                    }
                    InvalidationScope::Global => {
                        store.flush().await?;
                        Ok(1)
                    }
                }
            }
            .await;

            match result {
                Ok(removed) => {
                    tier_metrics.record_invalidation(removed);
                    removed_total += removed;
                    info!(tier = tier.as_str(), removed, scope = ?scope, "cache invalidated");
                }
                Err(e) => {
                    tier_metrics.record_error();
                    warn!(tier = tier.as_str(), "invalidation failed: {e}");
                }
            }
        }

        // Edge invalidations additionally purge the CDN for addressable scopes.
        if tiers.contains(&CacheTier::Edge) {
            if let Some(cdn) = &self.cdn {
                let paths = match &scope {
                    InvalidationScope::Exact(key) => key_paths(std::slice::from_ref(key)),
                    InvalidationScope::Prefix(prefix) => key_paths(std::slice::from_ref(prefix)),
                    _ => Vec::new(),
                };
                if !paths.is_empty() {
                    let cdn = cdn.clone();
                    tokio::spawn(async move { cdn.purge(&paths).await });
                }
            }
        }

        Ok(removed_total)
    }

    async fn scan_and_delete(&self, store: &dyn KvStore, pattern: &str) -> Result<u64> {
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let (next, keys) = store.scan(pattern, cursor, 100).await?;
            if !keys.is_empty() {
                removed += store.del(&keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    /// Pre-warm a tier by fetching URLs through the origin client
    pub async fn warm(&self, urls: &[String], tier: CacheTier) {
        if let Some(cdn) = &self.cdn {
            let cdn = cdn.clone();
            let urls = urls.to_vec();
            tokio::spawn(async move { cdn.warm(&urls).await });
        }

        let Some(origin) = &self.origin else { return };
        for url in urls {
            match origin.fetch(url).await {
                Ok(response) => {
                    let entry = CacheEntry::new(
                        format!("cache:{url}"),
                        response.body,
                        response.content_type,
                        self.default_ttl,
                    )
                    .with_headers(response.headers)
                    .with_source(url.clone());
                    let key = entry.key.clone();
                    if let Err(e) = self.set(&key, entry, tier).await {
                        warn!(url, "cache warm store failed: {e}");
                    }
                }
                Err(e) => warn!(url, "cache warm fetch failed: {e}"),
            }
        }
    }

    /// Kick off a direct-to-origin refresh for a stale entry, writing the
    /// fresh copy through to the tier it was found in
    fn spawn_revalidation(&self, stale: &CacheEntry, tier: CacheTier) {
        let Some(origin) = self.origin.clone() else {
            debug!(key = %stale.key, "stale entry served without origin to revalidate");
            return;
        };
        let Some(source) = stale.source.clone() else {
            debug!(key = %stale.key, "stale entry has no source to revalidate from");
            return;
        };
        let Some(store) = self.stores.get(&tier).cloned() else { return };

        let key = stale.key.clone();
        let tags: Vec<String> = stale.tags.iter().cloned().collect();
        let ttl = self.default_ttl;
        let compress = self.enable_compression;

        tokio::spawn(async move {
            match origin.fetch(&source).await {
                Ok(response) => {
                    let mut fresh =
                        CacheEntry::new(key.clone(), response.body, response.content_type, ttl)
                            .with_headers(response.headers)
                            .with_tags(tags)
                            .with_source(source);
                    if compress {
                        fresh.maybe_compress();
                    }
                    let store_ttl = ttl + STALE_GRACE;
                    match fresh.to_bytes() {
                        Ok(bytes) => {
                            if let Err(e) = store.set_ex(&key, &bytes, store_ttl).await {
                                warn!(key, "revalidation write-through failed: {e}");
                            } else {
                                debug!(key, "revalidated stale entry");
                            }
                        }
                        Err(e) => warn!(key, "revalidation serialization failed: {e}"),
                    }
                }
                Err(e) => warn!(key, "revalidation fetch failed: {e}"),
            }
        });
    }

    /// Metrics snapshot per tier
    pub fn metrics(&self) -> HashMap<String, TierMetricsSnapshot> {
        self.metrics
            .iter()
            .map(|(tier, metrics)| (tier.as_str().to_string(), metrics.snapshot()))
            .collect()
    }
}

/// Map cache keys (`cache:<path>:<hash>`) back to URL paths for CDN purges
fn key_paths(keys: &[String]) -> Vec<String> {
    keys.iter()
        .filter_map(|key| {
            let mut parts = key.splitn(3, ':');
            let prefix = parts.next()?;
            let path = parts.next()?;
            (prefix == "cache" && !path.is_empty()).then(|| path.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use stratus_store::MemoryStore;

    fn cache() -> EdgeCache {
        EdgeCache::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            true,
        )
    }

    fn entry(key: &str, body: &[u8], ttl: Duration) -> CacheEntry {
        CacheEntry::new(key, body.to_vec(), "text/plain", ttl)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = cache();
        let key = "cache:/users:abc";
        cache
            .set(key, entry(key, b"payload", Duration::from_secs(60)), CacheTier::Edge)
            .await
            .unwrap();

        let hit = cache.get(key, CacheTier::Edge, CacheStrategy::CacheFirst).await.unwrap();
        assert_eq!(hit.decoded_value().unwrap(), b"payload");
        assert_eq!(hit.hit_count, 1);

        let snapshot = cache.metrics();
        assert_eq!(snapshot["edge"].hits, 1);
    }

    #[tokio::test]
    async fn lower_tier_hits_promote_upward() {
        let cache = cache();
        let key = "cache:/users:abc";
        cache
            .set(key, entry(key, b"payload", Duration::from_secs(60)), CacheTier::Origin)
            .await
            .unwrap();

        let hit = cache.get(key, CacheTier::Edge, CacheStrategy::CacheFirst).await.unwrap();
        assert_eq!(hit.decoded_value().unwrap(), b"payload");

        // the entry now lives in the edge tier directly
        let direct = cache.get(key, CacheTier::Edge, CacheStrategy::CacheOnly).await;
        assert!(direct.is_some());
        // and was written through the regional tier on the way up
        let regional = cache.get(key, CacheTier::Regional, CacheStrategy::CacheOnly).await;
        assert!(regional.is_some());
    }

    #[tokio::test]
    async fn cache_only_never_probes_lower_tiers() {
        let cache = cache();
        let key = "cache:/users:abc";
        cache
            .set(key, entry(key, b"payload", Duration::from_secs(60)), CacheTier::Origin)
            .await
            .unwrap();

        assert!(cache.get(key, CacheTier::Edge, CacheStrategy::CacheOnly).await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_evict_and_miss() {
        let cache = cache();
        let key = "cache:/users:abc";
        cache
            .set(key, entry(key, b"payload", Duration::from_secs(1)), CacheTier::Edge)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get(key, CacheTier::Edge, CacheStrategy::CacheFirst).await.is_none());
        let snapshot = cache.metrics();
        assert_eq!(snapshot["edge"].evictions, 1);
    }

    struct CountingOrigin {
        body: Mutex<Vec<u8>>,
        fetches: Mutex<u32>,
    }

    #[async_trait]
    impl Origin for CountingOrigin {
        async fn fetch(&self, _source: &str) -> Result<OriginResponse> {
            *self.fetches.lock() += 1;
            Ok(OriginResponse {
                body: self.body.lock().clone(),
                content_type: "text/plain".to_string(),
                headers: HashMap::new(),
            })
        }
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_stale_then_refreshes() {
        let origin = Arc::new(CountingOrigin {
            body: Mutex::new(b"v2".to_vec()),
            fetches: Mutex::new(0),
        });
        let cache = cache().with_origin(origin.clone());

        let key = "cache:/doc:abc";
        let stale = entry(key, b"v1", Duration::from_secs(1)).with_source("https://origin/doc");
        cache.set(key, stale, CacheTier::Edge).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        // stale serve triggers the async refresh
        let hit = cache
            .get(key, CacheTier::Edge, CacheStrategy::StaleWhileRevalidate)
            .await
            .unwrap();
        assert_eq!(hit.decoded_value().unwrap(), b"v1");

        // wait for the revalidation task to write through
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*origin.fetches.lock(), 1);

        let fresh = cache.get(key, CacheTier::Edge, CacheStrategy::CacheFirst).await.unwrap();
        assert_eq!(fresh.decoded_value().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn warm_fetches_through_the_origin_and_stores() {
        let origin = Arc::new(CountingOrigin {
            body: Mutex::new(b"warmed".to_vec()),
            fetches: Mutex::new(0),
        });
        let cache = cache().with_origin(origin.clone());

        cache
            .warm(&["https://origin/popular".to_string()], CacheTier::Regional)
            .await;
        assert_eq!(*origin.fetches.lock(), 1);

        let hit = cache
            .get("cache:https://origin/popular", CacheTier::Regional, CacheStrategy::CacheOnly)
            .await
            .unwrap();
        assert_eq!(hit.decoded_value().unwrap(), b"warmed");
        assert_eq!(hit.source.as_deref(), Some("https://origin/popular"));
    }

    #[tokio::test]
    async fn exact_invalidation_removes_from_all_tiers() {
        let cache = cache();
        let key = "cache:/users:abc";
        for tier in CacheTier::all() {
            cache.set(key, entry(key, b"x", Duration::from_secs(60)), tier).await.unwrap();
        }

        let removed =
            cache.invalidate(InvalidationScope::Exact(key.to_string()), None).await.unwrap();
        assert_eq!(removed, 3);
        for tier in CacheTier::all() {
            assert!(cache.get(key, tier, CacheStrategy::CacheOnly).await.is_none());
        }
    }

    #[tokio::test]
    async fn prefix_invalidation_scans_matching_keys() {
        let cache = cache();
        for i in 0..5 {
            let key = format!("cache:/users:{i}");
            cache
                .set(&key, entry(&key, b"x", Duration::from_secs(60)), CacheTier::Edge)
                .await
                .unwrap();
        }
        let other = "cache:/orders:1";
        cache
            .set(other, entry(other, b"x", Duration::from_secs(60)), CacheTier::Edge)
            .await
            .unwrap();

        let removed = cache
            .invalidate(
                InvalidationScope::Prefix("cache:/users:".to_string()),
                Some(CacheTier::Edge),
            )
            .await
            .unwrap();
        assert_eq!(removed, 5);
        assert!(cache.get(other, CacheTier::Edge, CacheStrategy::CacheOnly).await.is_some());
    }

    #[tokio::test]
    async fn tag_invalidation_follows_the_tag_index() {
        let cache = cache();
        let tagged_a = entry("cache:/a:1", b"x", Duration::from_secs(60))
            .with_tags(["users".to_string()]);
        let tagged_b = entry("cache:/b:2", b"x", Duration::from_secs(60))
            .with_tags(["users".to_string()]);
        let untagged = entry("cache:/c:3", b"x", Duration::from_secs(60));

        cache.set("cache:/a:1", tagged_a, CacheTier::Edge).await.unwrap();
        cache.set("cache:/b:2", tagged_b, CacheTier::Edge).await.unwrap();
        cache.set("cache:/c:3", untagged, CacheTier::Edge).await.unwrap();

        cache
            .invalidate(InvalidationScope::Tag("users".to_string()), Some(CacheTier::Edge))
            .await
            .unwrap();

        assert!(cache.get("cache:/a:1", CacheTier::Edge, CacheStrategy::CacheOnly).await.is_none());
        assert!(cache.get("cache:/b:2", CacheTier::Edge, CacheStrategy::CacheOnly).await.is_none());
        assert!(cache.get("cache:/c:3", CacheTier::Edge, CacheStrategy::CacheOnly).await.is_some());
    }

    #[tokio::test]
    async fn global_invalidation_flushes_the_tier() {
        let cache = cache();
        for i in 0..3 {
            let key = format!("cache:/k:{i}");
            cache
                .set(&key, entry(&key, b"x", Duration::from_secs(60)), CacheTier::Edge)
                .await
                .unwrap();
        }
        cache.invalidate(InvalidationScope::Global, Some(CacheTier::Edge)).await.unwrap();
        for i in 0..3 {
            let key = format!("cache:/k:{i}");
            assert!(cache.get(&key, CacheTier::Edge, CacheStrategy::CacheOnly).await.is_none());
        }
    }

    #[tokio::test]
    async fn invalidation_is_idempotent() {
        let cache = cache();
        let key = "cache:/users:abc";
        cache
            .set(key, entry(key, b"x", Duration::from_secs(60)), CacheTier::Edge)
            .await
            .unwrap();

        let first =
            cache.invalidate(InvalidationScope::Exact(key.to_string()), None).await.unwrap();
        let second =
            cache.invalidate(InvalidationScope::Exact(key.to_string()), None).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn repeated_set_leaves_identical_state() {
        let cache = cache();
        let key = "cache:/users:abc";
        let e = entry(key, b"payload", Duration::from_secs(60));
        cache.set(key, e.clone(), CacheTier::Edge).await.unwrap();
        cache.set(key, e, CacheTier::Edge).await.unwrap();

        let hit = cache.get(key, CacheTier::Edge, CacheStrategy::CacheFirst).await.unwrap();
        assert_eq!(hit.decoded_value().unwrap(), b"payload");
    }

    #[test]
    fn key_paths_extracts_url_paths() {
        let keys = vec!["cache:/users:abcd".to_string(), "session:xyz".to_string()];
        assert_eq!(key_paths(&keys), vec!["/users".to_string()]);
    }
}
