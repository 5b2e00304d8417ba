//! Injected cache abstraction.
//!
//! Caches never hand out references into their storage: `get` clones, `set`
//! replaces an entry wholesale. Expired entries are treated as absent on read
//! and physically removed by capacity eviction or [`Cache::sweep`].

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

pub trait Cache<K, V>: Send + Sync {
    fn get(&self, key: &K, now: DateTime<Utc>) -> Option<V>;
    fn set(&self, key: K, value: V, expires_at: DateTime<Utc>);
    fn evict(&self, key: &K) -> Option<V>;
    /// Drops every entry expired at `now`; returns how many were removed.
    fn sweep(&self, now: DateTime<Utc>) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    tick: u64,
}

struct LruInner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Recency index: oldest tick first.
    order: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: Clone + Eq + Hash, V> LruInner<K, V> {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// Capacity-bounded least-recently-used cache with per-entry expiry.
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<LruInner<K, V>>,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LruInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, LruInner<K, V>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<K, V> Cache<K, V> for LruCache<K, V>
where
    K: Clone + Eq + Hash + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        let mut inner = self.lock();
        let expired = inner.entries.get(key).map(|entry| now >= entry.expires_at)?;
        if expired {
            inner.remove(key);
            return None;
        }

        let tick = inner.bump();
        let entry = inner.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.tick, tick);
        let value = entry.value.clone();
        inner.order.remove(&previous);
        inner.order.insert(tick, key.clone());
        Some(value)
    }

    fn set(&self, key: K, value: V, expires_at: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.remove(&key);
        while inner.entries.len() >= self.capacity {
            if inner.evict_oldest().is_none() {
                break;
            }
        }
        let tick = inner.bump();
        inner.order.insert(tick, key.clone());
        inner.entries.insert(key, Entry { value, expires_at, tick });
    }

    fn evict(&self, key: &K) -> Option<V> {
        self.lock().remove(key).map(|entry| entry.value)
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Cache, LruCache};

    fn base() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).single().expect("valid timestamp")
    }

    #[test]
    fn capacity_evicts_least_recently_used_entry() {
        let cache = LruCache::new(2);
        let now = base();
        let later = now + Duration::minutes(5);

        cache.set("a", 1, later);
        cache.set("b", 2, later);
        assert_eq!(cache.get(&"a", now), Some(1));

        cache.set("c", 3, later);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b", now), None, "b was least recently used");
        assert_eq!(cache.get(&"a", now), Some(1));
        assert_eq!(cache.get(&"c", now), Some(3));
    }

    #[test]
    fn expired_entries_are_absent_on_read() {
        let cache = LruCache::new(4);
        let now = base();
        cache.set("k", "v", now + Duration::seconds(30));

        assert_eq!(cache.get(&"k", now + Duration::seconds(29)), Some("v"));
        assert_eq!(cache.get(&"k", now + Duration::seconds(30)), None);
        assert!(cache.is_empty(), "expired read should physically remove the entry");
    }

    #[test]
    fn set_replaces_entry_wholesale() {
        let cache = LruCache::new(4);
        let now = base();
        cache.set("k", vec![1, 2], now + Duration::minutes(1));
        cache.set("k", vec![3], now + Duration::minutes(1));

        assert_eq!(cache.get(&"k", now), Some(vec![3]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = LruCache::new(8);
        let now = base();
        cache.set("stale", 1, now - Duration::seconds(1));
        cache.set("fresh", 2, now + Duration::minutes(1));

        assert_eq!(cache.sweep(now), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict(&"fresh"), Some(2));
        assert!(cache.is_empty());
    }
}
