//! Access-pattern-driven cache layer.
//!
//! Wraps a [`TtlCache`] with per-key telemetry and computes an optimal TTL
//! from two signals: access frequency over the last hour and the key's hit
//! rate. Hot keys live longer, cold keys expire sooner, keys with a poor hit
//! rate get shortened so stale loads retry earlier.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use super::store::{CacheStats, TtlCache};
use crate::error::DispatchError;

/// Access log bound per key.
pub const ACCESS_LOG_MAX: usize = 200;

/// Entries kept when an overflowing access log is trimmed.
pub const ACCESS_LOG_TRIM: usize = 100;

/// Window over which access frequency is measured.
const FREQUENCY_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Minimum recorded accesses before the TTL adapts at all.
const MIN_ACCESSES_TO_ADAPT: usize = 5;

/// Bounds for the computed TTL, in minutes.
const TTL_MIN_MINUTES: u64 = 1;
const TTL_MAX_MINUTES: u64 = 120;

/// Per-key access telemetry.
#[derive(Debug, Default)]
struct KeyTelemetry {
    /// Recent access instants, bounded to [`ACCESS_LOG_MAX`].
    accesses: VecDeque<Instant>,
    hits: u64,
    lookups: u64,
}

impl KeyTelemetry {
    fn record_access(&mut self, now: Instant) {
        self.accesses.push_back(now);
        if self.accesses.len() > ACCESS_LOG_MAX {
            let drop = self.accesses.len() - ACCESS_LOG_TRIM;
            self.accesses.drain(..drop);
        }
    }

    fn recent_accesses(&self, now: Instant) -> usize {
        self.accesses
            .iter()
            .filter(|at| now.duration_since(**at) <= FREQUENCY_WINDOW)
            .count()
    }

    fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

/// One entry for [`AdaptiveCache::preload`].
pub struct PreloadEntry<T> {
    pub key: String,
    pub base_minutes: u64,
    pub loader: Box<dyn Fn() -> BoxFuture<'static, Result<T, DispatchError>> + Send + Sync>,
}

/// TTL cache with per-key access telemetry and adaptive TTL.
///
/// Composes the base cache; telemetry lives beside it in per-key map entries
/// so concurrent keys never contend on one lock.
pub struct AdaptiveCache<T> {
    base: TtlCache<T>,
    telemetry: DashMap<String, KeyTelemetry>,
}

impl<T: Clone> AdaptiveCache<T> {
    pub fn new() -> Self {
        Self {
            base: TtlCache::new(),
            telemetry: DashMap::new(),
        }
    }

    /// Returns the cached value for `key`, or runs `loader` and caches the
    /// result under the computed optimal TTL.
    ///
    /// Loader failures are returned as-is and cache nothing.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        base_minutes: u64,
        loader: F,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let now = Instant::now();
        self.telemetry
            .entry(key.to_string())
            .or_default()
            .record_access(now);

        if let Some(value) = self.base.get(key) {
            let mut entry = self.telemetry.entry(key.to_string()).or_default();
            entry.hits += 1;
            entry.lookups += 1;
            return Ok(value);
        }
        self.telemetry.entry(key.to_string()).or_default().lookups += 1;

        let value = loader().await?;
        let ttl_minutes = self.optimal_ttl(key, base_minutes);
        debug!(key, ttl_minutes, "cache miss, loaded and stored");
        self.base.set(key, value.clone(), ttl_minutes);
        Ok(value)
    }

    /// Computes the TTL in minutes for `key`, starting from `base_minutes`.
    ///
    /// Frequency in the last hour sets the multiplier (>50 ⇒ 3.0, >20 ⇒ 2.0,
    /// <5 ⇒ 0.5); a proven hit rate (>0.9 over more than 10 lookups) adds
    /// 20%, a poor one (<0.3) removes 20%. The result is clamped to
    /// [1, 120]. With fewer than [`MIN_ACCESSES_TO_ADAPT`] recorded accesses
    /// the base TTL is returned unchanged.
    pub fn optimal_ttl(&self, key: &str, base_minutes: u64) -> u64 {
        let Some(entry) = self.telemetry.get(key) else {
            return base_minutes;
        };
        if entry.accesses.len() < MIN_ACCESSES_TO_ADAPT {
            return base_minutes;
        }

        let frequency = entry.recent_accesses(Instant::now());
        compute_ttl(base_minutes, frequency, entry.lookups, entry.hit_rate())
    }

    /// Warms the cache by running every entry's loader concurrently.
    ///
    /// Individual failures are logged and isolated; one bad loader never
    /// stops the rest. Returns how many entries loaded successfully.
    pub async fn preload(&self, entries: Vec<PreloadEntry<T>>) -> usize {
        let results = join_all(entries.iter().map(|entry| async {
            self.get_or_load(&entry.key, entry.base_minutes, || (entry.loader)())
                .await
                .map_err(|err| (entry.key.clone(), err))
        }))
        .await;

        let mut loaded = 0;
        for result in results {
            match result {
                Ok(_) => loaded += 1,
                Err((key, err)) => warn!(%key, error = %err, "cache preload entry failed"),
            }
        }
        loaded
    }

    /// Removes every key containing `substring` from the base cache.
    pub fn invalidate(&self, substring: &str) -> usize {
        self.base.invalidate(substring)
    }

    /// Drops expired entries from the base cache.
    pub fn sweep_expired(&self) -> usize {
        self.base.sweep_expired()
    }

    /// Drops all cached values and telemetry.
    pub fn clear(&self) {
        self.base.clear();
        self.telemetry.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.base.stats()
    }
}

impl<T: Clone> Default for AdaptiveCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The TTL formula, separated from the telemetry plumbing.
fn compute_ttl(base_minutes: u64, frequency: usize, lookups: u64, hit_rate: f64) -> u64 {
    let mut multiplier: f64 = if frequency > 50 {
        3.0
    } else if frequency > 20 {
        2.0
    } else if frequency < 5 {
        0.5
    } else {
        1.0
    };

    if lookups > 10 {
        if hit_rate > 0.9 {
            multiplier *= 1.2;
        } else if hit_rate < 0.3 {
            multiplier *= 0.8;
        }
    }

    ((base_minutes as f64 * multiplier).floor() as u64).clamp(TTL_MIN_MINUTES, TTL_MAX_MINUTES)
}
