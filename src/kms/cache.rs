//! Bounded TTL caches fronting the KMS: alias resolution (positive and
//! negative) and EDEK→decryptor. The only hard requirement carried over
//! from the DEK manager (owned by `dek::DekManager`, not here) is
//! "at-most-one in-flight" generation per KEK; size/TTL eviction here is a
//! plain capacity-bounded map with lazy expiry rather than a full
//! Caffeine-style refresh-ahead implementation.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A size-bounded map where entries expire `ttl` after insertion (or after
/// last access, when `touch_on_get` is set — used for the decrypt cache's
/// expire-after-access semantics).
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    capacity: usize,
    ttl: Duration,
    touch_on_get: bool,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration, touch_on_get: bool) -> Self {
        TtlCache {
            entries: DashMap::new(),
            capacity,
            ttl,
            touch_on_get,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        if self.touch_on_get {
            if let Some(mut entry) = self.entries.get_mut(key) {
                entry.inserted_at = Instant::now();
            }
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            // No real LRU bookkeeping; evict an arbitrary entry to keep the
            // map bounded. The eviction policy isn't load-bearing, only the
            // capacity bound is.
            if let Some(evict_key) = self.entries.iter().next().map(|e| e.key().clone()) {
                self.entries.remove(&evict_key);
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Alias → KEK-id resolution cache, with a short-TTL negative cache for
/// aliases the KMS reported unknown.
pub struct AliasCache {
    positive: TtlCache<String, String>,
    negative: TtlCache<String, ()>,
}

impl AliasCache {
    pub fn new(
        capacity: usize,
        expire_after_write: Duration,
        not_found_expire_after_write: Duration,
    ) -> Self {
        AliasCache {
            positive: TtlCache::new(capacity, expire_after_write, false),
            negative: TtlCache::new(capacity, not_found_expire_after_write, false),
        }
    }

    pub fn get(&self, alias: &str) -> Option<Option<String>> {
        if let Some(kek_id) = self.positive.get(&alias.to_string()) {
            return Some(Some(kek_id));
        }
        if self.negative.get(&alias.to_string()).is_some() {
            return Some(None);
        }
        None
    }

    pub fn record_resolved(&self, alias: &str, kek_id: String) {
        self.positive.insert(alias.to_string(), kek_id);
    }

    pub fn record_unknown(&self, alias: &str) {
        self.negative.insert(alias.to_string(), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_entry_is_served_until_ttl() {
        let cache = TtlCache::new(10, Duration::from_secs(60), false);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn capacity_bound_is_respected() {
        let cache = TtlCache::new(2, Duration::from_secs(60), false);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.insert("c".to_string(), 3);
        assert!(cache.len() <= 2);
    }

    #[test]
    fn alias_cache_distinguishes_unknown_from_uncached() {
        let cache = AliasCache::new(10, Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(cache.get("missing"), None);
        cache.record_unknown("missing");
        assert_eq!(cache.get("missing"), Some(None));
        cache.record_resolved("known", "kek-1".to_string());
        assert_eq!(cache.get("known"), Some(Some("kek-1".to_string())));
    }
}
