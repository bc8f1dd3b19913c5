//! In-process L1 cache.
//!
//! # Responsibilities
//! - Bounded capacity with least-recently-used eviction
//! - Short absolute TTL (with jitter) bounding staleness when an
//!   invalidation message is lost
//! - Keep expired values resident until evicted so reads can fall back to
//!   them while the store is down
//!
//! # Design Decisions
//! - Values are immutable `Arc` snapshots; the lock only guards the
//!   recency list and is never held across I/O or `.await`
//! - Hits are read under a shared lock. Recency is then promoted only if
//!   the exclusive lock is free, so under contention LRU order is
//!   approximate rather than reads queueing behind each other
//! - Expiry is checked against the injected clock, not `Instant`

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;

use crate::clock::Clock;
use crate::observability::metrics;

struct Slot<V> {
    value: Arc<V>,
    expires_at: i64,
}

/// Bounded LRU cache with absolute TTL.
pub struct LocalCache<K: Hash + Eq, V> {
    name: &'static str,
    entries: RwLock<LruCache<K, Slot<V>>>,
    ttl_millis: i64,
    jitter_millis: i64,
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq + Clone, V> std::fmt::Debug for LocalCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("ttl_millis", &self.ttl_millis)
            .finish()
    }
}

impl<K: Hash + Eq + Clone, V> LocalCache<K, V> {
    pub fn new(
        name: &'static str,
        capacity: usize,
        ttl_millis: i64,
        jitter_millis: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: RwLock::new(LruCache::new(capacity)),
            ttl_millis,
            jitter_millis,
            clock,
        }
    }

    /// Fresh value, bumping recency when uncontended. Expired values count
    /// as a miss.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let now = self.clock.now_millis();
        let hit = match self.entries.read().peek(key) {
            Some(slot) if slot.expires_at > now => Some(slot.value.clone()),
            _ => None,
        };
        if hit.is_some() {
            if let Some(mut entries) = self.entries.try_write() {
                entries.promote(key);
            }
        }
        metrics::record_cache_lookup(self.name, if hit.is_some() { "hit" } else { "miss" });
        hit
    }

    /// Value regardless of expiry, without bumping recency.
    pub fn get_stale(&self, key: &K) -> Option<Arc<V>> {
        let stale = self.entries.read().peek(key).map(|slot| slot.value.clone());
        if stale.is_some() {
            metrics::record_cache_lookup(self.name, "stale");
        }
        stale
    }

    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.insert_arc(key, value.clone());
        value
    }

    pub fn insert_arc(&self, key: K, value: Arc<V>) {
        let jitter = if self.jitter_millis > 0 {
            fastrand::i64(0..=self.jitter_millis)
        } else {
            0
        };
        let expires_at = self.clock.now_millis() + self.ttl_millis - jitter;
        let len = {
            let mut entries = self.entries.write();
            entries.put(key, Slot { value, expires_at });
            entries.len()
        };
        metrics::record_cache_size(self.name, len);
    }

    /// Remove one key. Returns true if it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.write().pop(key).is_some()
    }

    /// Remove every key matching the predicate. Returns the number removed.
    pub fn invalidate_matching<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut entries = self.entries.write();
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(k, _)| predicate(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl_millis(&self) -> i64 {
        self.ttl_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(capacity: usize, clock: Arc<ManualClock>) -> LocalCache<String, u32> {
        LocalCache::new("test", capacity, 5_000, 0, clock)
    }

    #[test]
    fn test_ttl_expiry_keeps_stale_copy() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(4, clock.clone());
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".into()).as_deref(), Some(&1));

        clock.advance_millis(5_000);
        assert!(cache.get(&"a".into()).is_none());
        assert_eq!(cache.get_stale(&"a".into()).as_deref(), Some(&1));
    }

    #[test]
    fn test_lru_eviction() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(2, clock);
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get(&"a".into()).is_some());
        cache.insert("c".into(), 3);

        assert!(cache.get(&"a".into()).is_some());
        assert!(cache.get(&"b".into()).is_none());
        assert!(cache.get(&"c".into()).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_contended_hit_skips_promotion() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(2, clock);
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        {
            let _other_reader = cache.entries.read();
            assert_eq!(cache.get(&"a".into()).as_deref(), Some(&1));
        }
        // "a" kept its place, so it is still the eviction candidate.
        cache.insert("c".into(), 3);
        assert!(cache.get(&"a".into()).is_none());
        assert!(cache.get(&"b".into()).is_some());
    }

    #[test]
    fn test_invalidate_matching() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(8, clock);
        cache.insert("x@prod".into(), 1);
        cache.insert("x@staging".into(), 2);
        cache.insert("y@prod".into(), 3);

        let removed = cache.invalidate_matching(|k| k.starts_with("x@"));
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate(&"y@prod".into()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_jitter_shortens_ttl_within_bound() {
        let clock = Arc::new(ManualClock::new(0));
        let cache: LocalCache<String, u32> = LocalCache::new("test", 4, 5_000, 1_000, clock.clone());
        cache.insert("a".into(), 1);
        clock.advance_millis(3_999);
        assert!(cache.get(&"a".into()).is_some());
        clock.advance_millis(1_001);
        assert!(cache.get(&"a".into()).is_none());
    }
}
