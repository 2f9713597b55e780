//! Cache entry model, key derivation and compression

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::time::Duration;

use stratus_common::{Error, Result};

/// A single cached response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
    pub content_type: String,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub etag: String,
    pub tags: BTreeSet<String>,
    pub hit_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub compressed: bool,
    pub size_bytes: usize,
    /// Where to refetch this entry from during revalidation
    pub source: Option<String>,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        content_type: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = value.len();
        let etag = compute_etag(&value);
        Self {
            key: key.into(),
            value,
            content_type: content_type.into(),
            headers: HashMap::new(),
            created_at: now,
            expires_at: now
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(0)),
            etag,
            tags: BTreeSet::new(),
            hit_count: 0,
            last_accessed: now,
            compressed: false,
            size_bytes,
            source: None,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Age of the entry in whole seconds
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    /// Gzip the value in place when it is large enough and compresses by at
    /// least ten percent
    pub fn maybe_compress(&mut self) {
        if self.compressed || self.value.len() <= 1024 {
            return;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&self.value).is_err() {
            return;
        }
        let Ok(compressed) = encoder.finish() else { return };
        if (compressed.len() as f64) <= self.value.len() as f64 * 0.9 {
            self.value = compressed;
            self.compressed = true;
            self.size_bytes = self.value.len();
        }
    }

    /// The stored value, decompressed when necessary
    pub fn decoded_value(&self) -> Result<Vec<u8>> {
        if !self.compressed {
            return Ok(self.value.clone());
        }
        let mut decoder = GzDecoder::new(self.value.as_slice());
        let mut out = Vec::with_capacity(self.value.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Cache(format!("decompression failed: {e}")))?;
        Ok(out)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// ETag for a body: quoted, deterministic digest of the bytes
pub fn compute_etag(value: &[u8]) -> String {
    let digest = Sha256::digest(value);
    format!("\"{}\"", hex_encode(&digest[..16]))
}

/// Derive the cache key for a request.
///
/// `query` must be the raw query string; it is split and sorted so parameter
/// order does not fragment the cache. Selected Vary headers are folded in as
/// `name:value` pairs.
pub fn derive_key(
    scheme: &str,
    host: &str,
    path: &str,
    query: &str,
    vary: &[(String, String)],
) -> String {
    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    params.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(scheme.as_bytes());
    hasher.update(b"|");
    hasher.update(host.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(params.join("&").as_bytes());
    for (name, value) in vary {
        hasher.update(b"|");
        hasher.update(name.to_ascii_lowercase().as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
    }

    let digest = hasher.finalize();
    format!("cache:{path}:{}", hex_encode(&digest[..16]))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok()).collect()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::hex_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::hex_decode(&raw).ok_or_else(|| serde::de::Error::custom("invalid hex value"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_deterministic_and_quoted() {
        let a = compute_etag(b"hello");
        let b = compute_etag(b"hello");
        assert_eq!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_ne!(a, compute_etag(b"other"));
    }

    #[test]
    fn key_is_stable_under_query_reordering() {
        let a = derive_key("https", "api.example.com", "/users", "a=1&b=2", &[]);
        let b = derive_key("https", "api.example.com", "/users", "b=2&a=1", &[]);
        assert_eq!(a, b);
        assert!(a.starts_with("cache:/users:"));
        // 16-byte digest renders as 32 hex characters
        assert_eq!(a.rsplit(':').next().unwrap().len(), 32);
    }

    #[test]
    fn vary_headers_fragment_the_key() {
        let plain = derive_key("https", "api.example.com", "/users", "", &[]);
        let gzip = derive_key(
            "https",
            "api.example.com",
            "/users",
            "",
            &[("Accept-Encoding".to_string(), "gzip".to_string())],
        );
        assert_ne!(plain, gzip);
    }

    #[test]
    fn serialization_round_trips() {
        let mut entry = CacheEntry::new("cache:/k:abc", b"payload".to_vec(), "text/plain", Duration::from_secs(60))
            .with_tags(["users".to_string()]);
        entry.hit_count = 3;
        let raw = entry.to_bytes().unwrap();
        let back = CacheEntry::from_bytes(&raw).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn large_compressible_values_are_gzipped() {
        let body = vec![b'a'; 64 * 1024];
        let mut entry =
            CacheEntry::new("k", body.clone(), "text/plain", Duration::from_secs(60));
        entry.maybe_compress();
        assert!(entry.compressed);
        assert!(entry.size_bytes < body.len());
        assert_eq!(entry.decoded_value().unwrap(), body);
    }

    #[test]
    fn small_or_incompressible_values_stay_raw() {
        let mut small = CacheEntry::new("k", b"tiny".to_vec(), "text/plain", Duration::from_secs(60));
        small.maybe_compress();
        assert!(!small.compressed);

        // sha256 output bytes repeated: no gzip win
        let mut noise = Vec::with_capacity(4096);
        let mut seed = Sha256::digest(b"seed").to_vec();
        while noise.len() < 4096 {
            seed = Sha256::digest(&seed).to_vec();
            noise.extend_from_slice(&seed);
        }
        let mut incompressible =
            CacheEntry::new("k", noise, "application/octet-stream", Duration::from_secs(60));
        incompressible.maybe_compress();
        assert!(!incompressible.compressed);
    }

    #[test]
    fn expiry_and_age_follow_the_clock() {
        let entry = CacheEntry::new("k", b"v".to_vec(), "text/plain", Duration::from_secs(10));
        let now = Utc::now();
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + ChronoDuration::seconds(11)));
        assert_eq!(entry.age_seconds(now + ChronoDuration::seconds(5)), 5);
    }
}
