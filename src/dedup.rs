use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use dashmap::DashSet;

/// Process-wide bounded cache of recently emitted result hashes, used to
/// suppress echoed output reaching the sink twice. Backed by `DashSet` for
/// concurrent lookups; insertion order is tracked separately so the cache
/// can evict its oldest entry once `capacity` is exceeded.
pub struct DedupCache {
    seen: DashSet<u64>,
    order: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: DashSet::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns `true` if `(text, source_tag)` was already seen recently, and
    /// records it if not.
    pub fn check_and_insert(&self, text: &str, source_tag: &str) -> bool {
        let key = hash_of(text, source_tag);
        if self.seen.contains(&key) {
            return true;
        }
        self.seen.insert(key);

        let mut order = self.order.lock().unwrap();
        order.push_back(key);
        if order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

fn hash_of(text: &str, source_tag: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    source_tag.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_duplicate_within_window() {
        let cache = DedupCache::new(8);
        assert!(!cache.check_and_insert("hello", "mic"));
        assert!(cache.check_and_insert("hello", "mic"));
    }

    #[test]
    fn different_source_tags_are_distinct() {
        let cache = DedupCache::new(8);
        assert!(!cache.check_and_insert("hello", "mic"));
        assert!(!cache.check_and_insert("hello", "file"));
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let cache = DedupCache::new(2);
        cache.check_and_insert("a", "s");
        cache.check_and_insert("b", "s");
        cache.check_and_insert("c", "s"); // evicts "a"
        assert_eq!(cache.len(), 2);
        assert!(!cache.check_and_insert("a", "s")); // "a" was evicted, not a duplicate anymore
    }
}
