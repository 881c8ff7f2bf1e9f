//! Time-bounded cache for hot entities.
//!
//! Expiration is lazy (checked on read) plus a periodic [`TtlCache::sweep`]
//! driven by the pipeline's maintenance loop. Each key-prefix partition is
//! trimmed to a size bound by evicting the oldest entries first. The cache
//! is an injected component with an explicit lifecycle and no module-level
//! state, so tests and parallel pipelines stay isolated.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use ursa_core::Clock;

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// String-keyed TTL cache with per-partition size bounds.
///
/// Keys follow a `partition:rest` convention; the segment before the first
/// `:` names the partition used for eviction accounting.
pub struct TtlCache<V> {
    inner: RwLock<HashMap<String, Entry<V>>>,
    default_ttl: Duration,
    max_entries_per_partition: usize,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: StdDuration, max_entries_per_partition: usize, clock: Arc<dyn Clock>) -> Self {
        let default_ttl =
            Duration::from_std(default_ttl).unwrap_or_else(|_| Duration::seconds(30));
        Self {
            inner: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries_per_partition: max_entries_per_partition.max(1),
            clock,
        }
    }

    /// Fetch a value, treating TTL-expired entries as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        {
            let map = self.inner.read().expect("cache lock poisoned");
            match map.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it so the sweep has less to do.
        let mut map = self.inner.write().expect("cache lock poisoned");
        if map.get(key).is_some_and(|entry| entry.expires_at <= now) {
            map.remove(key);
        }
        None
    }

    /// Store a value under the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, None);
    }

    /// Store a value, optionally overriding the default TTL.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<StdDuration>) {
        let now = self.clock.now();
        let ttl = ttl
            .and_then(|ttl| Duration::from_std(ttl).ok())
            .unwrap_or(self.default_ttl);
        let mut map = self.inner.write().expect("cache lock poisoned");
        map.insert(
            key.into(),
            Entry {
                value,
                cached_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Remove every key matching `pattern`.
    ///
    /// A trailing `*` makes the pattern a prefix match; anything else is an
    /// exact key. Returns the number of entries removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut map = self.inner.write().expect("cache lock poisoned");
        let before = map.len();
        if let Some(prefix) = pattern.strip_suffix('*') {
            map.retain(|key, _| !key.starts_with(prefix));
        } else {
            map.remove(pattern);
        }
        before - map.len()
    }

    /// Drop TTL-expired entries and trim oversized partitions oldest-first.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.inner.write().expect("cache lock poisoned");
        let before = map.len();
        map.retain(|_, entry| entry.expires_at > now);

        let mut partition_sizes: HashMap<String, usize> = HashMap::new();
        for key in map.keys() {
            *partition_sizes.entry(partition_of(key).to_string()).or_default() += 1;
        }
        for (partition, size) in partition_sizes {
            if size <= self.max_entries_per_partition {
                continue;
            }
            let excess = size - self.max_entries_per_partition;
            let mut oldest: Vec<(String, DateTime<Utc>)> = map
                .iter()
                .filter(|(key, _)| partition_of(key) == partition)
                .map(|(key, entry)| (key.clone(), entry.cached_at))
                .collect();
            oldest.sort_by_key(|(_, cached_at)| *cached_at);
            for (key, _) in oldest.into_iter().take(excess) {
                map.remove(&key);
            }
        }

        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, remaining = map.len(), "cache sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry; part of the explicit shutdown lifecycle.
    pub fn clear(&self) {
        self.inner.write().expect("cache lock poisoned").clear();
    }
}

fn partition_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ursa_core::ManualClock;

    fn fixture() -> (TtlCache<u32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cache = TtlCache::new(StdDuration::from_secs(30), 3, clock.clone());
        (cache, clock)
    }

    #[test]
    fn expired_values_are_never_returned() {
        let (cache, clock) = fixture();
        cache.set("metrics:a", 1);
        assert_eq!(cache.get("metrics:a"), Some(1));

        clock.advance(Duration::seconds(31));
        assert_eq!(cache.get("metrics:a"), None);
        // Lazy expiry removed the entry on read.
        assert!(cache.is_empty());
    }

    #[test]
    fn per_entry_ttl_overrides_default() {
        let (cache, clock) = fixture();
        cache.set_with_ttl("metrics:a", 1, Some(StdDuration::from_secs(120)));
        clock.advance(Duration::seconds(60));
        assert_eq!(cache.get("metrics:a"), Some(1));
    }

    #[test]
    fn invalidate_supports_prefix_patterns() {
        let (cache, _) = fixture();
        cache.set("metrics:a", 1);
        cache.set("metrics:b", 2);
        cache.set("candles:a", 3);

        assert_eq!(cache.invalidate("metrics:*"), 2);
        assert_eq!(cache.get("metrics:a"), None);
        assert_eq!(cache.get("candles:a"), Some(3));

        assert_eq!(cache.invalidate("candles:a"), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_trims_partitions_oldest_first() {
        let (cache, clock) = fixture();
        for (i, key) in ["metrics:a", "metrics:b", "metrics:c", "metrics:d"]
            .iter()
            .enumerate()
        {
            cache.set(*key, i as u32);
            clock.advance(Duration::seconds(1));
        }
        assert_eq!(cache.len(), 4);

        let removed = cache.sweep();
        assert_eq!(removed, 1);
        // The oldest entry went first.
        assert_eq!(cache.get("metrics:a"), None);
        assert_eq!(cache.get("metrics:d"), Some(3));
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let (cache, clock) = fixture();
        cache.set("metrics:a", 1);
        clock.advance(Duration::seconds(31));
        cache.set("metrics:b", 2);

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("metrics:b"), Some(2));
    }
}
