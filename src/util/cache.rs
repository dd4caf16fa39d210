//! Bounded in-memory cache with least-recently-used eviction.
//!
//! Used for per-process reuse of query-expansion results and per-request
//! reuse of routing decisions. Capacity is fixed at construction; inserting
//! into a full cache evicts the entry that was touched longest ago.

use rustc_hash::FxHashMap;
use std::hash::Hash;

/// A fixed-capacity map that evicts its least-recently-used entry on insert.
///
/// Recency is tracked with a logical clock bumped on every access, so both
/// [`LruCache::get`] and [`LruCache::insert`] refresh an entry's position.
/// Lookups are O(1); eviction scans for the stalest entry, which is fine at
/// the small capacities this crate configures (tens to hundreds of entries).
///
/// # Examples
///
/// ```
/// use carbonloom::util::LruCache;
///
/// let mut cache = LruCache::new(2);
/// cache.insert("a", 1);
/// cache.insert("b", 2);
/// cache.get(&"a");
/// cache.insert("c", 3); // evicts "b", the least recently used
///
/// assert!(cache.get(&"b").is_none());
/// assert_eq!(cache.get(&"a"), Some(&1));
/// ```
#[derive(Clone, Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: FxHashMap<K, Slot<V>>,
}

#[derive(Clone, Debug)]
struct Slot<V> {
    value: V,
    last_used: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    ///
    /// A capacity of zero is treated as one so the cache is always usable.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: FxHashMap::default(),
        }
    }

    /// Returns the stored value for `key`, refreshing its recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|slot| {
            slot.last_used = tick;
            &slot.value
        })
    }

    /// Inserts `value` under `key`, evicting the least-recently-used entry
    /// if the cache is full and `key` is not already present.
    pub fn insert(&mut self, key: K, value: V) {
        self.tick += 1;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            Slot {
                value,
                last_used: self.tick,
            },
        );
    }

    /// Returns true if `key` is present without refreshing its recency.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every entry, keeping the configured capacity.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
