//! Result cache — bounded, time-expiring map from normalized query to prediction
//!
//! - Capacity-bounded with least-recently-used eviction (`lru::LruCache`)
//! - Fixed TTL from insertion; a hit never extends it unless `sliding_ttl` is set
//! - Expired entries are dropped lazily on `get` and eagerly by `purge_expired`
//!
//! All state sits behind one mutex, so every single-key operation is atomic to
//! concurrent callers. Nothing here awaits.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::{QclassError, Result};
use crate::models::Prediction;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Prediction,
    expires_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    counters: Counters,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

pub struct ResultCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    sliding: bool,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("sliding", &self.sliding)
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    /// Create a cache holding at most `capacity` entries (minimum 1) for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                counters: Counters::default(),
            }),
            ttl,
            sliding: false,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.ttl()).with_sliding_ttl(config.sliding_ttl)
    }

    /// Re-arm an entry's TTL on every hit.
    pub fn with_sliding_ttl(mut self, sliding: bool) -> Self {
        self.sliding = sliding;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| QclassError::Cache(format!("cache lock poisoned: {e}")))
    }

    /// Look up a key. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Result<Option<Prediction>> {
        let now = Instant::now();
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let expired = match inner.entries.peek(key).map(|entry| entry.expires_at <= now) {
            None => {
                inner.counters.misses += 1;
                return Ok(None);
            }
            Some(expired) => expired,
        };

        if expired {
            inner.entries.pop(key);
            inner.counters.expirations += 1;
            inner.counters.misses += 1;
            return Ok(None);
        }

        let ttl = self.ttl;
        let sliding = self.sliding;
        let value = inner.entries.get_mut(key).map(|entry| {
            if sliding {
                entry.expires_at = now + ttl;
            }
            entry.value.clone()
        });
        inner.counters.hits += 1;
        Ok(value)
    }

    /// Insert or overwrite a key, resetting its TTL. Evicts the least recently
    /// used entry first when the cache is full.
    pub fn put(&self, key: impl Into<String>, value: Prediction) -> Result<()> {
        let key = key.into();
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        let mut inner = self.lock()?;
        if let Some((evicted, _)) = inner.entries.push(key.clone(), entry) {
            if evicted != key {
                inner.counters.evictions += 1;
                tracing::debug!(key = %evicted, "Evicted least recently used cache entry");
            }
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.entries.pop(key).is_some())
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.entries.clear();
        Ok(())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        inner.counters.expirations += expired.len() as u64;
        Ok(expired.len())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let inner = self.lock()?;
        Ok(CacheStats {
            entries: inner.entries.len(),
            capacity: inner.entries.cap().get(),
            ttl_seconds: self.ttl.as_secs(),
            hits: inner.counters.hits,
            misses: inner.counters.misses,
            evictions: inner.counters.evictions,
            expirations: inner.counters.expirations,
        })
    }

    /// Poison the internal lock so every later call fails with `QclassError::Cache`.
    #[cfg(test)]
    pub(crate) fn poison(self: &std::sync::Arc<Self>) {
        let cache = std::sync::Arc::clone(self);
        let _ = std::thread::spawn(move || {
            let _guard = cache.inner.lock().unwrap();
            panic!("poisoning cache lock for test");
        })
        .join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn p(label: &str, probability: f64) -> Prediction {
        Prediction::new(label, probability)
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_get_returns_value() {
        let cache = ResultCache::new(4, Duration::from_secs(60));
        cache.put("what is 2+2?", p("simple", 0.92)).unwrap();
        assert_eq!(cache.get("what is 2+2?").unwrap(), Some(p("simple", 0.92)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_returns_none() {
        let cache = ResultCache::new(4, Duration::from_secs(60));
        assert_eq!(cache.get("absent").unwrap(), None);
        assert_eq!(cache.stats().unwrap().misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_absent_at_exact_ttl() {
        let cache = ResultCache::new(4, Duration::from_secs(60));
        cache.put("k", p("simple", 0.5)).unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("k").unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").unwrap(), None);
        assert_eq!(cache.len().unwrap(), 0, "expired entry should be purged lazily");
        assert_eq!(cache.stats().unwrap().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hits_do_not_extend_ttl() {
        let cache = ResultCache::new(4, Duration::from_secs(10));
        cache.put("k", p("simple", 0.5)).unwrap();
        for _ in 0..9 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(cache.get("k").unwrap().is_some());
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_ttl_rearms_on_hit() {
        let cache = ResultCache::new(4, Duration::from_secs(10)).with_sliding_ttl(true);
        cache.put("k", p("simple", 0.5)).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.get("k").unwrap().is_some());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.get("k").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_resets_ttl() {
        let cache = ResultCache::new(4, Duration::from_secs(10));
        cache.put("k", p("simple", 0.5)).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put("k", p("complex", 0.9)).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k").unwrap(), Some(p("complex", 0.9)));
        assert_eq!(cache.stats().unwrap().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_exactly_lru() {
        let cache = ResultCache::new(3, Duration::from_secs(60));
        cache.put("a", p("simple", 0.1)).unwrap();
        cache.put("b", p("simple", 0.2)).unwrap();
        cache.put("c", p("simple", 0.3)).unwrap();

        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("a").unwrap().is_some());

        cache.put("d", p("simple", 0.4)).unwrap();

        assert_eq!(cache.len().unwrap(), 3);
        assert_eq!(cache.get("b").unwrap(), None);
        assert_eq!(cache.get("a").unwrap(), Some(p("simple", 0.1)));
        assert_eq!(cache.get("c").unwrap(), Some(p("simple", 0.3)));
        assert_eq!(cache.get("d").unwrap(), Some(p("simple", 0.4)));
        assert_eq!(cache.stats().unwrap().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_removes_only_expired() {
        let cache = ResultCache::new(8, Duration::from_secs(10));
        cache.put("old", p("simple", 0.1)).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.put("new", p("simple", 0.2)).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.get("new").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_clear() {
        let cache = ResultCache::new(8, Duration::from_secs(10));
        cache.put("a", p("simple", 0.1)).unwrap();
        cache.put("b", p("simple", 0.2)).unwrap();
        assert!(cache.remove("a").unwrap());
        assert!(!cache.remove("a").unwrap());
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_zero_capacity_clamped_to_one() {
        let cache = ResultCache::new(0, Duration::from_secs(10));
        assert_eq!(cache.stats().unwrap().capacity, 1);
    }

    #[test]
    fn test_poisoned_lock_reports_cache_error() {
        let cache = Arc::new(ResultCache::new(4, Duration::from_secs(10)));
        cache.poison();
        assert!(matches!(cache.get("k"), Err(QclassError::Cache(_))));
        assert!(matches!(cache.put("k", p("simple", 0.5)), Err(QclassError::Cache(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_puts_stay_within_capacity() {
        let cache = Arc::new(ResultCache::new(16, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    cache.put(format!("k-{t}-{i}"), p("simple", 0.5)).unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cache.len().unwrap(), 16);
        assert_eq!(cache.stats().unwrap().evictions, 8 * 50 - 16);
    }
}
