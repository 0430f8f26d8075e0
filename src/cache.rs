//! TTL + LRU cache with optional transparent compression and
//! dependency-tag invalidation.
//!
//! Grounded on `original_source/core/cache_manager.py`'s `CacheManager`
//! (ordering/TTL/compression/stats), `ResponseCache` (request-fingerprint
//! memoization with a deny-list of non-memoizable endpoints) and
//! `SmartCache` (dependency-tag invalidation, cache warming). The teacher
//! crate lists `quick_cache` as a dependency but never uses it; `quick_cache`
//! has no hook for per-entry compression or dependency-tag invalidation, so
//! this is a fresh ordered map rather than a wrapper around it (see
//! DESIGN.md).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::RandomState;
use dashmap::DashMap;
use indexmap::IndexMap;
use salvo::oapi::ToSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

/// Endpoints whose responses must never be memoized: streaming chat,
/// session creation, and transaction endpoints all have side effects or are
/// inherently non-idempotent.
pub const MEMOIZATION_DENY_LIST: &[&str] =
    &["/api/chat", "/api/sessions/create", "/api/transaction"];

pub fn should_memoize(endpoint: &str) -> bool {
    !MEMOIZATION_DENY_LIST.contains(&endpoint)
}

/// Forms a stable fingerprint for (endpoint, params, body) under sorted
/// keys, suitable as a memoization cache key.
pub fn request_fingerprint(
    endpoint: &str,
    params: &serde_json::Value,
    body: &serde_json::Value,
) -> String {
    let canonical = serde_json::json!({
        "endpoint": endpoint,
        "params": sort_keys(params),
        "body": sort_keys(body),
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[&k]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

struct StoredEntry {
    payload: Vec<u8>,
    compressed: bool,
    expires_at: Instant,
    tags: Vec<String>,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }
}

pub struct Cache {
    entries: Mutex<IndexMap<String, StoredEntry, RandomState>>,
    /// tag -> set of keys that declared it
    dependencies: DashMap<String, Vec<String>>,
    max_size: usize,
    default_ttl: Duration,
    compression_threshold: usize,
    counters: Counters,
}

impl Cache {
    pub fn new(
        max_size: usize,
        default_ttl: Duration,
        compression_threshold: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(IndexMap::with_hasher(RandomState::new())),
            dependencies: DashMap::new(),
            max_size,
            default_ttl,
            compression_threshold,
            counters: Counters::default(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().await;
        let Some(idx) = entries.get_index_of(key) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let expired = entries[idx].expires_at <= Instant::now();
        if expired {
            entries.shift_remove_index(idx);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let last = entries.len() - 1;
        entries.move_index(idx, last);
        let entry = &entries[last];
        let decoded = decode(&entry.payload, entry.compressed);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        match decoded {
            Ok(bytes) => ciborium::from_reader(bytes.as_slice()).ok(),
            Err(_) => None,
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) {
        let mut buf = Vec::new();
        if ciborium::into_writer(value, &mut buf).is_err() {
            return;
        }
        let (payload, compressed) = if buf.len() > self.compression_threshold
        {
            match zstd::encode_all(buf.as_slice(), 3) {
                Ok(z) => (z, true),
                Err(_) => (buf, false),
            }
        } else {
            (buf, false)
        };

        let entry = StoredEntry {
            payload,
            compressed,
            expires_at: Instant::now()
                + ttl.unwrap_or(self.default_ttl),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };

        {
            let mut entries = self.entries.lock().await;
            entries.shift_remove(key);
            entries.insert(key.to_string(), entry);
            while entries.len() > self.max_size {
                entries.shift_remove_index(0);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        for tag in tags {
            self.dependencies
                .entry(tag.to_string())
                .or_default()
                .push(key.to_string());
        }
    }

    pub async fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        entries.shift_remove(key);
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.dependencies.clear();
    }

    /// Deletes every key registered under `tag` and removes the mapping.
    pub async fn invalidate_tag(&self, tag: &str) {
        if let Some((_, keys)) = self.dependencies.remove(tag) {
            let mut entries = self.entries.lock().await;
            for key in keys {
                entries.shift_remove(&key);
            }
        }
    }

    /// Populates any of `keys` that are currently missing, leaving existing
    /// entries untouched.
    pub async fn warm<T, F, Fut>(&self, producers: Vec<(String, F)>)
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        for (key, producer) in producers {
            if self.get::<T>(&key).await.is_some() {
                continue;
            }
            let value = producer().await;
            self.set(&key, &value, None, &[]).await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

fn decode(payload: &[u8], compressed: bool) -> std::io::Result<Vec<u8>> {
    if !compressed {
        return Ok(payload.to_vec());
    }
    let mut out = Vec::new();
    let mut decoder = zstd::Decoder::new(payload)?;
    std::io::copy(&mut decoder, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_preserves_value() {
        let cache = Cache::new(10, Duration::from_secs(60), 1024);
        cache.set("k", &"hello world".to_string(), None, &[]).await;
        let v: Option<String> = cache.get("k").await;
        assert_eq!(v.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn compression_round_trips_large_values() {
        let cache = Cache::new(10, Duration::from_secs(60), 8);
        let big = "x".repeat(4096);
        cache.set("k", &big, None, &[]).await;
        let v: Option<String> = cache.get("k").await;
        assert_eq!(v, Some(big));
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let cache = Cache::new(2, Duration::from_secs(60), 1024);
        cache.set("a", &1i32, None, &[]).await;
        cache.set("b", &2i32, None, &[]).await;
        cache.set("c", &3i32, None, &[]).await;
        assert_eq!(cache.get::<i32>("a").await, None);
        assert_eq!(cache.get::<i32>("b").await, Some(2));
        assert_eq!(cache.get::<i32>("c").await, Some(3));
    }

    #[tokio::test]
    async fn ttl_expiry_reports_miss_not_hit() {
        let cache = Cache::new(10, Duration::from_millis(10), 1024);
        cache.set("k", &1i32, None, &[]).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get::<i32>("k").await, None);
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn dependency_invalidation_removes_tagged_entries() {
        let cache = Cache::new(10, Duration::from_secs(60), 1024);
        cache.set("a", &1i32, None, &["user:1"]).await;
        cache.set("b", &2i32, None, &["user:1"]).await;
        cache.set("c", &3i32, None, &["user:2"]).await;
        cache.invalidate_tag("user:1").await;
        assert_eq!(cache.get::<i32>("a").await, None);
        assert_eq!(cache.get::<i32>("b").await, None);
        assert_eq!(cache.get::<i32>("c").await, Some(3));
    }

    #[test]
    fn memoization_deny_list_excludes_chat() {
        assert!(!should_memoize("/api/chat"));
        assert!(should_memoize("/api/capabilities"));
    }

    #[test]
    fn request_fingerprint_is_order_independent() {
        let a = request_fingerprint(
            "/x",
            &serde_json::json!({"b": 1, "a": 2}),
            &serde_json::json!({}),
        );
        let b = request_fingerprint(
            "/x",
            &serde_json::json!({"a": 2, "b": 1}),
            &serde_json::json!({}),
        );
        assert_eq!(a, b);
    }
}
