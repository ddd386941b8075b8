//! LRU cache for decoded blocks.

use crate::blockstore::BlockKey;
use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Accounted size of an entry recording a missing block
const NEGATIVE_ENTRY_SIZE: usize = 64;

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU cache of decoded blocks with memory-bounded eviction.
///
/// `None` values record blocks known to be missing so that repeated queries
/// do not hit storage again.
pub struct BlockCache {
    cache: LruCache<BlockKey, Option<Bytes>>,
    memory_limit: usize,
    current_memory: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

fn entry_size(value: &Option<Bytes>) -> usize {
    value.as_ref().map(|b| b.len()).unwrap_or(NEGATIVE_ENTRY_SIZE)
}

impl BlockCache {
    /// Create a new block cache with the given memory limit in bytes.
    pub fn new(memory_limit: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            memory_limit,
            current_memory: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// `Some(Some(data))` for a cached block, `Some(None)` for a block known
    /// to be missing, `None` on a cache miss.
    pub fn get(&mut self, key: &BlockKey) -> Option<Option<Bytes>> {
        if let Some(data) = self.cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(data.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Check if a key exists in the cache without updating LRU order.
    pub fn contains(&self, key: &BlockKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a block, evicting least recently used entries to make room.
    /// Entries larger than the whole budget are not cached.
    pub fn insert(&mut self, key: BlockKey, data: Option<Bytes>) {
        self.invalidate(&key);
        let data_size = entry_size(&data);
        if data_size > self.memory_limit {
            return;
        }

        // Evict if necessary to make room
        while self.current_memory + data_size > self.memory_limit && !self.cache.is_empty() {
            if let Some((_, evicted)) = self.cache.pop_lru() {
                self.current_memory = self.current_memory.saturating_sub(entry_size(&evicted));
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.cache.put(key, data);
        self.current_memory += data_size;
    }

    /// Drop one entry
    pub fn invalidate(&mut self, key: &BlockKey) {
        if let Some(old) = self.cache.pop(key) {
            self.current_memory = self.current_memory.saturating_sub(entry_size(&old));
        }
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
            memory_bytes: self.current_memory as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Clear all entries from the cache.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.current_memory = 0;
    }

    /// Get the current memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.current_memory
    }

    /// Get the memory limit in bytes.
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(block: u64) -> BlockKey {
        BlockKey::new(0, 0, block)
    }

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = BlockCache::new(1024 * 1024);
        let data = Bytes::from_static(&[1, 2, 3, 4]);

        assert!(cache.get(&key(1)).is_none());
        cache.insert(key(1), Some(data.clone()));
        assert_eq!(cache.get(&key(1)), Some(Some(data)));
        assert_eq!(cache.memory_usage(), 4);
    }

    #[test]
    fn test_negative_entries() {
        let mut cache = BlockCache::new(1024);
        cache.insert(key(7), None);
        assert_eq!(cache.get(&key(7)), Some(None));
        assert_eq!(cache.memory_usage(), NEGATIVE_ENTRY_SIZE);

        // a later write replaces the negative entry
        cache.insert(key(7), Some(Bytes::from_static(b"abcd")));
        assert_eq!(cache.get(&key(7)), Some(Some(Bytes::from_static(b"abcd"))));
        assert_eq!(cache.memory_usage(), 4);
    }

    #[test]
    fn test_cache_lru_eviction() {
        // room for four 16-byte blocks
        let mut cache = BlockCache::new(64);
        for i in 0..10 {
            cache.insert(key(i), Some(Bytes::from(vec![i as u8; 16])));
        }

        // Earlier entries should have been evicted
        assert!(cache.get(&key(0)).is_none());
        // Later entries should still be present
        assert!(cache.get(&key(9)).is_some());
        assert_eq!(cache.len(), 4);
        assert!(cache.memory_usage() <= cache.memory_limit());

        let stats = cache.stats();
        assert_eq!(stats.evictions, 6);
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let mut cache = BlockCache::new(8);
        cache.insert(key(1), Some(Bytes::from(vec![0u8; 9])));
        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn test_cache_stats() {
        let mut cache = BlockCache::new(1024 * 1024);
        cache.insert(key(1), Some(Bytes::from_static(&[1])));

        // Hit
        cache.get(&key(1));
        // Miss
        cache.get(&key(2));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hit_rate(), 0.5);

        cache.invalidate(&key(1));
        cache.clear();
        assert!(cache.is_empty());
    }
}
