//! Size-bounded LRU storage for cache entries.

use std::collections::{BTreeMap, HashMap};

/// Types that know their in-memory size.
///
/// The cache accounts `key length + value weight` bytes per entry.
pub trait Weighted {
    /// Size of the value in bytes.
    fn weight(&self) -> usize;
}

impl Weighted for crate::ByteView {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weighted for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

/// Callback invoked with `(key, value)` for every evicted entry.
pub type EvictionHook<V> = Box<dyn Fn(&str, &V) + Send>;

struct Entry<V> {
    tick: u64,
    value: V,
}

/// A size-bounded key/value store that evicts the least recently used entry
/// when the configured byte budget is exceeded.
///
/// Recency is tracked with a monotonic tick per access: the entry holding
/// the smallest tick is the least recently used one. A `max_bytes` of 0
/// disables bounding. This type is not internally synchronized; callers
/// wrap it in a lock (see [`Group`](crate::group::Group)).
pub struct LruCache<V> {
    max_bytes: usize,
    used_bytes: usize,
    next_tick: u64,
    /// tick -> key, oldest first. Always the same size as `entries`.
    recency: BTreeMap<u64, String>,
    entries: HashMap<String, Entry<V>>,
    on_evict: Option<EvictionHook<V>>,
}

impl<V> std::fmt::Debug for LruCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("max_bytes", &self.max_bytes)
            .field("used_bytes", &self.used_bytes)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<V> LruCache<V>
where
    V: Clone + Weighted,
{
    /// Create a cache bounded to `max_bytes` (0 = unbounded).
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
            next_tick: 0,
            recency: BTreeMap::new(),
            entries: HashMap::new(),
            on_evict: None,
        }
    }

    /// Create a bounded cache that reports evicted entries to `hook`.
    pub fn with_eviction_hook(max_bytes: usize, hook: EvictionHook<V>) -> Self {
        Self {
            on_evict: Some(hook),
            ..Self::new(max_bytes)
        }
    }

    /// Get the value for `key`, promoting the entry to most recently used.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.next_tick += 1;
        self.recency.insert(tick, key.to_string());
        Some(entry.value.clone())
    }

    /// Insert `value` under `key`, or update the existing entry in place.
    ///
    /// The entry becomes the most recently used one. Afterwards, entries are
    /// evicted oldest-first until the byte budget holds again; the entry
    /// inserted here is never chosen, so a single over-budget value stays
    /// resident.
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        let tick = self.next_tick;
        self.next_tick += 1;

        match self.entries.get_mut(&key) {
            Some(entry) => {
                self.used_bytes = self.used_bytes - entry.value.weight() + value.weight();
                self.recency.remove(&entry.tick);
                entry.tick = tick;
                entry.value = value;
                self.recency.insert(tick, key);
            }
            None => {
                self.used_bytes += key.len() + value.weight();
                self.recency.insert(tick, key.clone());
                self.entries.insert(key, Entry { tick, value });
            }
        }

        while self.max_bytes > 0 && self.used_bytes > self.max_bytes && self.entries.len() > 1 {
            self.remove_oldest();
        }
    }

    /// Evict the least recently used entry, if any, returning it.
    ///
    /// The eviction hook observes the entry before it is returned.
    pub fn remove_oldest(&mut self) -> Option<(String, V)> {
        let (_, key) = self.recency.pop_first()?;
        let entry = self
            .entries
            .remove(&key)
            .expect("recency map entry without a stored value");
        self.used_bytes -= key.len() + entry.value.weight();
        if let Some(hook) = &self.on_evict {
            hook(&key, &entry.value);
        }
        Some((key, entry.value))
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently accounted for (`key length + value weight` summed
    /// over resident entries).
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn cache(max_bytes: usize) -> LruCache<String> {
        LruCache::new(max_bytes)
    }

    #[test]
    fn test_get_miss_and_hit() {
        let mut c = cache(0);
        assert_eq!(c.get("key1"), None);
        c.insert("key1", "1234".to_string());
        assert_eq!(c.get("key1"), Some("1234".to_string()));
        assert_eq!(c.len(), 1);
        assert_eq!(c.used_bytes(), "key1".len() + "1234".len());
    }

    #[test]
    fn test_eviction_is_oldest_first() {
        // Budget fits exactly two of the three entries.
        let (k1, k2, k3) = ("key1", "key2", "k3");
        let (v1, v2, v3) = ("value1", "value2", "v3");
        let cap = k1.len() + v1.len() + k2.len() + v2.len();

        let mut c = cache(cap);
        c.insert(k1, v1.to_string());
        c.insert(k2, v2.to_string());
        c.insert(k3, v3.to_string());

        assert_eq!(c.get(k1), None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_get_promotes() {
        let cap = 2 * ("keyN".len() + "valueN".len());
        let mut c = cache(cap);
        c.insert("key1", "value1".to_string());
        c.insert("key2", "value2".to_string());

        // key1 is now the most recent entry, so key2 must go first.
        assert!(c.get("key1").is_some());
        c.insert("key3", "value3".to_string());

        assert_eq!(c.get("key2"), None);
        assert!(c.get("key1").is_some());
        assert!(c.get("key3").is_some());
    }

    #[test]
    fn test_update_in_place_adjusts_used_bytes() {
        let mut c = cache(0);
        c.insert("key", "aa".to_string());
        assert_eq!(c.used_bytes(), 3 + 2);
        c.insert("key", "aaaa".to_string());
        assert_eq!(c.used_bytes(), 3 + 4);
        assert_eq!(c.len(), 1);
        c.insert("key", "a".to_string());
        assert_eq!(c.used_bytes(), 3 + 1);
    }

    #[test]
    fn test_eviction_hook_sees_each_eviction_once() {
        let (tx, rx) = mpsc::channel();
        let mut c = LruCache::with_eviction_hook(
            "key1".len() + "value1".len(),
            Box::new(move |k, v: &String| tx.send((k.to_string(), v.clone())).unwrap()),
        );
        c.insert("key1", "value1".to_string());
        c.insert("key2", "value2".to_string());
        c.insert("key3", "value3".to_string());

        let evicted: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            evicted,
            vec![
                ("key1".to_string(), "value1".to_string()),
                ("key2".to_string(), "value2".to_string()),
            ]
        );
    }

    #[test]
    fn test_over_budget_entry_stays_resident() {
        let mut c = cache(8);
        c.insert("small", "a".to_string());
        c.insert("k", "way too large for the budget".to_string());

        // Older entries are gone but the oversized newcomer survives.
        assert_eq!(c.get("small"), None);
        assert_eq!(c.len(), 1);
        assert!(c.get("k").is_some());
        assert!(c.used_bytes() > 8);
    }

    #[test]
    fn test_remove_oldest_on_empty() {
        let mut c = cache(0);
        assert!(c.remove_oldest().is_none());
        c.insert("key", "value".to_string());
        assert_eq!(c.remove_oldest(), Some(("key".to_string(), "value".to_string())));
        assert!(c.is_empty());
        assert_eq!(c.used_bytes(), 0);
    }

    #[test]
    fn test_unbounded_when_zero() {
        let mut c = cache(0);
        for i in 0..128 {
            c.insert(format!("key{i}"), "x".repeat(64));
        }
        assert_eq!(c.len(), 128);
    }
}
