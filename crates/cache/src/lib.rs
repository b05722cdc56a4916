//! Bounded LRU cache of SSTable data blocks.
//!
//! Keys are `(table id, block offset, block length)`; values are the verified
//! block payloads. Capacity is counted in bytes. A zero-capacity cache is a
//! pass-through: every `get` misses and `insert` drops the block, so all
//! reads go to disk.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Identifies one data block of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub table: Uuid,
    pub offset: u64,
    pub len: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub items: usize,
    pub bytes: usize,
}

struct Inner {
    /// key → (recency tick, block bytes)
    entries: HashMap<BlockKey, (u64, Arc<Vec<u8>>)>,
    /// recency tick → key; the smallest tick is the LRU victim.
    recency: BTreeMap<u64, BlockKey>,
    used: usize,
    tick: u64,
}

/// Bounded LRU block cache, internally synchronized.
pub struct BlockCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                used: 0,
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a block, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &BlockKey) -> Option<Arc<Vec<u8>>> {
        if self.capacity == 0 {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let promoted = inner.entries.get_mut(key).map(|slot| {
            let old_tick = std::mem::replace(&mut slot.0, tick);
            (old_tick, slot.1.clone())
        });
        match promoted {
            Some((old_tick, block)) => {
                inner.recency.remove(&old_tick);
                inner.recency.insert(tick, *key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(block)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts a block, evicting from the LRU tail until the cache fits its
    /// capacity again.
    pub fn insert(&self, key: BlockKey, block: Arc<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some((old_tick, old_block)) = inner.entries.insert(key, (tick, block.clone())) {
            inner.recency.remove(&old_tick);
            inner.used -= old_block.len();
        }
        inner.recency.insert(tick, key);
        inner.used += block.len();

        while inner.used > self.capacity {
            let Some((&victim_tick, &victim_key)) = inner.recency.iter().next() else {
                break;
            };
            inner.recency.remove(&victim_tick);
            if let Some((_, evicted)) = inner.entries.remove(&victim_key) {
                inner.used -= evicted.len();
            }
        }
    }

    /// Drops every cached block, keeping the hit/miss counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.used = 0;
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            items: inner.entries.len(),
            bytes: inner.used,
        }
    }

    /// Resets the hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BlockCache")
            .field("capacity", &self.capacity)
            .field("items", &stats.items)
            .field("bytes", &stats.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(offset: u64) -> BlockKey {
        BlockKey {
            table: Uuid::nil(),
            offset,
            len: 4096,
        }
    }

    fn block(fill: u8, len: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![fill; len])
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache = BlockCache::new(1024);
        cache.insert(key(0), block(1, 100));

        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(100)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.items, 1);
        assert_eq!(stats.bytes, 100);
    }

    #[test]
    fn eviction_removes_least_recently_used() {
        let cache = BlockCache::new(250);
        cache.insert(key(0), block(0, 100));
        cache.insert(key(1), block(1, 100));

        // Touch key 0 so key 1 becomes the LRU victim.
        assert!(cache.get(&key(0)).is_some());

        cache.insert(key(2), block(2, 100));
        assert!(cache.get(&key(0)).is_some(), "recently used block survives");
        assert!(cache.get(&key(1)).is_none(), "LRU block evicted");
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.stats().bytes <= 250);
    }

    #[test]
    fn reinsert_replaces_without_leaking_bytes() {
        let cache = BlockCache::new(1024);
        cache.insert(key(0), block(1, 100));
        cache.insert(key(0), block(2, 200));

        let stats = cache.stats();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.bytes, 200);
        assert_eq!(cache.get(&key(0)).unwrap()[0], 2);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = BlockCache::new(0);
        cache.insert(key(0), block(1, 100));
        assert!(cache.get(&key(0)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.items, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn oversized_block_does_not_wedge_the_cache() {
        let cache = BlockCache::new(100);
        cache.insert(key(0), block(1, 500));
        // The oversized block is evicted immediately; the cache stays usable.
        assert!(cache.stats().bytes <= 100);
        cache.insert(key(1), block(2, 50));
        assert!(cache.get(&key(1)).is_some());
    }

    #[test]
    fn reset_stats_clears_counters_only() {
        let cache = BlockCache::new(1024);
        cache.insert(key(0), block(1, 100));
        cache.get(&key(0));
        cache.reset_stats();

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.items, 1, "entries survive a stats reset");
    }
}
