//! Key-value store with per-entry TTL.
//!
//! Expiration is lazy: an entry past its TTL is dropped on the read that
//! finds it. There is no eviction policy beyond TTL; callers that need
//! bounded memory clear or invalidate explicitly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// One cached value with its insertion instant and TTL.
#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    inserted: Instant,
    ttl: Duration,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted) > self.ttl
    }
}

/// Counters reported by [`TtlCache::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit fraction over all reads, 0.0 with no reads.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    hits: u64,
    misses: u64,
}

/// Process-local cache with per-entry TTL.
pub struct TtlCache<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Returns the value for `key`, or `None` when absent or expired.
    ///
    /// An expired entry is removed by this read.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            Some(_) => {
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Stores `value` under `key` with a TTL in minutes.
    pub fn set(&self, key: impl Into<String>, value: T, ttl_minutes: u64) {
        self.set_with_ttl(key, value, Duration::from_secs(ttl_minutes * 60));
    }

    /// Stores `value` under `key` with an explicit TTL.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.insert(
            key.into(),
            Entry {
                value,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    /// Removes every key containing `substring`. Returns how many were removed.
    pub fn invalidate(&self, substring: &str) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.contains(substring));
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(substring, removed, "cache invalidation");
        }
        removed
    }

    /// Drops every expired entry now instead of waiting for lazy reads.
    /// Returns how many were removed. Used by the cleanup sweep job.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let dropped = inner.entries.len();
        inner.entries.clear();
        if dropped > 0 {
            tracing::info!(dropped, "cache cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_missing_returns_none() {
        let cache: TtlCache<String> = TtlCache::new();
        assert_eq!(cache.get("absent"), None);
    }

    #[test]
    fn test_set_and_get() {
        let cache = TtlCache::new();
        cache.set("k", "v".to_string(), 5);
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_expired_entry_returns_none() {
        let cache = TtlCache::new();
        cache.set_with_ttl("k", 42u32, Duration::from_millis(20));
        assert_eq!(cache.get("k"), Some(42));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k"), None);
        // The expired read removed the entry.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_overwrite_resets_ttl() {
        let cache = TtlCache::new();
        cache.set_with_ttl("k", 1u32, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(15));
        cache.set_with_ttl("k", 2u32, Duration::from_millis(50));
        thread::sleep(Duration::from_millis(20));
        // First TTL would have expired by now; the overwrite extended it.
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn test_invalidate_by_substring() {
        let cache = TtlCache::new();
        cache.set("drivers:v1:zone-a", 1u32, 5);
        cache.set("drivers:v2:zone-a", 2u32, 5);
        cache.set("orders:v1", 3u32, 5);

        let removed = cache.invalidate("drivers:");
        assert_eq!(removed, 2);
        assert_eq!(cache.get("drivers:v1:zone-a"), None);
        assert_eq!(cache.get("orders:v1"), Some(3));
    }

    #[test]
    fn test_invalidate_matches_mid_key() {
        let cache = TtlCache::new();
        cache.set("drivers:v1:zone-a", 1u32, 5);
        cache.set("drivers:v1:zone-b", 2u32, 5);

        let removed = cache.invalidate("zone-a");
        assert_eq!(removed, 1);
        assert_eq!(cache.get("drivers:v1:zone-b"), Some(2));
    }

    #[test]
    fn test_sweep_expired_removes_only_stale_entries() {
        let cache = TtlCache::new();
        cache.set_with_ttl("stale", 1u32, Duration::from_millis(10));
        cache.set_with_ttl("fresh", 2u32, Duration::from_secs(60));

        thread::sleep(Duration::from_millis(30));
        let removed = cache.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh"), Some(2));
    }

    #[test]
    fn test_clear_empties_cache() {
        let cache = TtlCache::new();
        cache.set("a", 1u32, 5);
        cache.set("b", 2u32, 5);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = TtlCache::new();
        cache.set("k", 1u32, 5);

        cache.get("k");
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_hit_rate_with_no_reads() {
        let cache: TtlCache<u32> = TtlCache::new();
        assert_eq!(cache.stats().hit_rate(), 0.0);
    }
}
