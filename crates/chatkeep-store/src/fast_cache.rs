//! Fast cache tier.
//!
//! A small synchronous-feeling key/value area that holds the latest
//! sanitized chat document so a restart can paint immediately, before the
//! disk backend answers. It has a hard byte quota: a write that would not
//! fit fails with [`StoreError::QuotaExceeded`] rather than evicting, and
//! callers treat that as a signal to stop using the tier.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Injected fast cache tier.
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn load(&self, key: &str) -> Option<Value>;

    /// Fails with [`StoreError::QuotaExceeded`] when the value does not fit.
    async fn store(&self, key: &str, value: &Value) -> StoreResult<()>;

    async fn remove(&self, key: &str);
}

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking how often the tier answered.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Writes refused for quota.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Hit rate as a value between 0.0 and 1.0 (0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rejected={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.rejected(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── local cache ──────────────────────────────────────────────────────

/// In-process fast tier backed by `moka::future::Cache`.
///
/// Values are kept as JSON strings; their byte length counts against the
/// quota.
#[derive(Clone)]
pub struct LocalCache {
    name: &'static str,
    inner: Cache<String, String>,
    sizes: Arc<Mutex<HashMap<String, usize>>>,
    quota_bytes: u64,
    stats: Arc<CacheStats>,
}

impl LocalCache {
    pub fn new(name: &'static str, quota_bytes: u64) -> Self {
        debug!(name, quota_bytes, "fast cache created");
        Self {
            name,
            inner: Cache::builder().name(name).build(),
            sizes: Arc::new(Mutex::new(HashMap::new())),
            quota_bytes,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Bytes currently accounted against the quota.
    pub fn used_bytes(&self) -> u64 {
        self.sizes
            .lock()
            .map(|sizes| sizes.values().map(|s| *s as u64).sum())
            .unwrap_or(0)
    }

    /// Reserve room for `key`, or report the overflow.
    fn reserve(&self, key: &str, size: usize) -> StoreResult<()> {
        let mut sizes = self
            .sizes
            .lock()
            .map_err(|e| StoreError::Cache(format!("size table poisoned: {e}")))?;
        let others: u64 = sizes
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, s)| *s as u64)
            .sum();
        if others + size as u64 > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                size,
                quota: self.quota_bytes,
            });
        }
        sizes.insert(key.to_string(), size);
        Ok(())
    }
}

#[async_trait]
impl FastCache for LocalCache {
    async fn load(&self, key: &str) -> Option<Value> {
        let Some(json) = self.inner.get(key).await else {
            self.stats.record_miss();
            debug!(cache = self.name, key, "fast cache miss");
            return None;
        };
        match serde_json::from_str(&json) {
            Ok(value) => {
                self.stats.record_hit();
                Some(value)
            }
            Err(err) => {
                warn!(cache = self.name, key, %err, "fast cache entry unreadable, evicting");
                self.remove(key).await;
                self.stats.record_miss();
                None
            }
        }
    }

    async fn store(&self, key: &str, value: &Value) -> StoreResult<()> {
        let json = serde_json::to_string(value)?;
        if let Err(err) = self.reserve(key, json.len()) {
            self.stats.record_rejected();
            return Err(err);
        }
        self.inner.insert(key.to_string(), json).await;
        debug!(cache = self.name, key, "fast cache store");
        Ok(())
    }

    async fn remove(&self, key: &str) {
        self.inner.invalidate(key).await;
        if let Ok(mut sizes) = self.sizes.lock() {
            sizes.remove(key);
        }
        debug!(cache = self.name, key, "fast cache remove");
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn store_and_load() {
        let cache = LocalCache::new("test", 1024);
        cache.store("k", &json!({"a": 1})).await.unwrap();
        assert_eq!(cache.load("k").await, Some(json!({"a": 1})));
        assert_eq!(cache.load("missing").await, None);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn oversized_value_is_rejected_without_eviction() {
        let cache = LocalCache::new("test", 64);
        cache.store("small", &json!("hello")).await.unwrap();

        let err = cache
            .store("big", &json!("x".repeat(100)))
            .await
            .unwrap_err();
        assert!(err.is_quota());
        assert_eq!(cache.stats().rejected(), 1);
        // The earlier entry survives.
        assert_eq!(cache.load("small").await, Some(json!("hello")));
        assert!(cache.load("big").await.is_none());
    }

    #[tokio::test]
    async fn overwrite_reuses_its_own_budget() {
        let cache = LocalCache::new("test", 40);
        cache.store("k", &json!("x".repeat(30))).await.unwrap();
        cache.store("k", &json!("y".repeat(30))).await.unwrap();
        assert_eq!(cache.used_bytes(), 32);
    }

    #[tokio::test]
    async fn remove_frees_quota() {
        let cache = LocalCache::new("test", 40);
        cache.store("a", &json!("x".repeat(30))).await.unwrap();
        assert!(cache.store("b", &json!("y".repeat(30))).await.is_err());
        cache.remove("a").await;
        cache.store("b", &json!("y".repeat(30))).await.unwrap();
        assert_eq!(cache.used_bytes(), 32);
    }

    #[test]
    fn stats_display() {
        let stats = CacheStats::default();
        stats.hits.store(3, Ordering::Relaxed);
        stats.misses.store(1, Ordering::Relaxed);
        let display = format!("{stats}");
        assert!(display.contains("hits=3"));
        assert!(display.contains("75.00%"));
    }
}
