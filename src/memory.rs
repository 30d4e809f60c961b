//! # Memory Tier
//!
//! The fast tier: an in-memory LRU bounded by total payload bytes rather
//! than entry count. The tier never performs I/O itself; when it runs over
//! budget the tier controller pops LRU tails and demotes them to the
//! on-disk store.

use lru::LruCache;
use parking_lot::RwLock;

struct MemoryInner {
    items: LruCache<String, Vec<u8>>,
    current_bytes: u64,
}

/// Byte-bounded in-memory LRU tier.
pub struct MemoryTier {
    inner: RwLock<MemoryInner>,
    max_bytes: u64,
}

impl MemoryTier {
    /// Create a tier with a byte budget.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                items: LruCache::unbounded(),
                current_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Insert or replace an item, moving it to the MRU position.
    pub fn insert(&self, key: &str, payload: Vec<u8>) {
        let mut inner = self.inner.write();
        let added = payload.len() as u64;
        if let Some(old) = inner.items.put(key.to_string(), payload) {
            inner.current_bytes -= old.len() as u64;
        }
        inner.current_bytes += added;
    }

    /// Fetch a payload, promoting the key to the MRU position.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.write().items.get(key).cloned()
    }

    /// Fetch a payload without disturbing the LRU order.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().items.peek(key).cloned()
    }

    /// Remove an item, returning its payload.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.write();
        let removed = inner.items.pop(key);
        if let Some(p) = &removed {
            inner.current_bytes -= p.len() as u64;
        }
        removed
    }

    /// Pop the least recently used item.
    pub fn pop_lru(&self) -> Option<(String, Vec<u8>)> {
        let mut inner = self.inner.write();
        let popped = inner.items.pop_lru();
        if let Some((_, p)) = &popped {
            inner.current_bytes -= p.len() as u64;
        }
        popped
    }

    /// Whether the tier currently holds a key.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().items.contains(key)
    }

    /// Whether the tier is above its byte budget.
    pub fn over_budget(&self) -> bool {
        self.inner.read().current_bytes > self.max_bytes
    }

    /// Number of items in the tier.
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    /// Whether the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of payload lengths currently held.
    pub fn current_bytes(&self) -> u64 {
        self.inner.read().current_bytes
    }

    /// Byte budget of the tier.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Drop every item without demotion.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.items.clear();
        inner.current_bytes = 0;
    }

    /// Cloned (key, payload) pairs in MRU-to-LRU order.
    ///
    /// Used by the backup engine to snapshot the tier without holding the
    /// lock across file writes.
    pub fn iter_snapshot(&self) -> Vec<(String, Vec<u8>)> {
        self.inner
            .read()
            .items
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let tier = MemoryTier::new(1024);
        tier.insert("a", b"hello".to_vec());
        assert_eq!(tier.get("a"), Some(b"hello".to_vec()));
        assert_eq!(tier.current_bytes(), 5);
    }

    #[test]
    fn test_overwrite_adjusts_bytes() {
        let tier = MemoryTier::new(1024);
        tier.insert("a", vec![0u8; 100]);
        tier.insert("a", vec![0u8; 40]);
        assert_eq!(tier.current_bytes(), 40);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_remove_adjusts_bytes() {
        let tier = MemoryTier::new(1024);
        tier.insert("a", vec![0u8; 10]);
        tier.insert("b", vec![0u8; 20]);
        assert_eq!(tier.remove("a"), Some(vec![0u8; 10]));
        assert_eq!(tier.current_bytes(), 20);
        assert_eq!(tier.remove("a"), None);
    }

    #[test]
    fn test_pop_lru_order() {
        let tier = MemoryTier::new(1024);
        tier.insert("first", vec![1]);
        tier.insert("second", vec![2]);
        tier.insert("third", vec![3]);

        // Touch "first" so "second" becomes the LRU tail.
        tier.get("first");

        let (key, _) = tier.pop_lru().unwrap();
        assert_eq!(key, "second");
    }

    #[test]
    fn test_over_budget() {
        let tier = MemoryTier::new(100);
        tier.insert("a", vec![0u8; 60]);
        assert!(!tier.over_budget());
        tier.insert("b", vec![0u8; 60]);
        assert!(tier.over_budget());
    }

    #[test]
    fn test_clear() {
        let tier = MemoryTier::new(100);
        tier.insert("a", vec![0u8; 60]);
        tier.clear();
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.current_bytes(), 0);
    }

    #[test]
    fn test_snapshot_clones_pairs() {
        let tier = MemoryTier::new(1024);
        tier.insert("a", b"x".to_vec());
        tier.insert("b", b"y".to_vec());
        let snapshot = tier.iter_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|(k, v)| k == "a" && v == b"x"));
    }
}
