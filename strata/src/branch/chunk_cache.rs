//! Residency bookkeeping for paged-tier chunks.
//!
//! The cache tracks which chunks are held in memory in least recently used
//! order. It does not own chunk data: the paged tier loads and evicts chunks
//! itself and only asks the cache which chunk should go next. Chunks are only
//! registered on first access, so nothing is preloaded.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

/// Counters of a paged branch's chunk traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub chunk_reads: u64,
    pub chunk_writes: u64,
    pub resident_chunks: u64,
}

impl ChunkStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Component-wise sum, for aggregating over branches.
    pub fn merge(&self, other: &ChunkStats) -> ChunkStats {
        ChunkStats {
            cache_hits: self.cache_hits + other.cache_hits,
            cache_misses: self.cache_misses + other.cache_misses,
            chunk_reads: self.chunk_reads + other.chunk_reads,
            chunk_writes: self.chunk_writes + other.chunk_writes,
            resident_chunks: self.resident_chunks + other.resident_chunks,
        }
    }
}

pub(crate) struct ChunkCache {
    order: Mutex<LruCache<u64, ()>>,
    hits: AtomicU64,
    misses: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl ChunkCache {
    pub(crate) fn new(max_chunks: usize) -> ChunkCache {
        let capacity = NonZeroUsize::new(max_chunks).unwrap_or(NonZeroUsize::MIN);
        ChunkCache {
            order: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Marks `chunk` as most recently used.
    ///
    /// Returns the chunk that fell out of the cache to make room, which the
    /// caller must flush and drop.
    pub(crate) fn touch(&self, chunk: u64) -> Option<u64> {
        let mut order = self.order.lock();
        if order.get(&chunk).is_some() {
            return None;
        }
        order
            .push(chunk, ())
            .and_then(|(evicted, _)| (evicted != chunk).then_some(evicted))
    }

    pub(crate) fn len(&self) -> usize {
        self.order.lock().len()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> ChunkStats {
        ChunkStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            chunk_reads: self.reads.load(Ordering::Relaxed),
            chunk_writes: self.writes.load(Ordering::Relaxed),
            resident_chunks: self.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_cache_new() {
        let cache = ChunkCache::new(10);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats(), ChunkStats::default());
    }

    #[test]
    fn test_touch_within_capacity() {
        let cache = ChunkCache::new(3);
        assert_eq!(cache.touch(1), None);
        assert_eq!(cache.touch(2), None);
        assert_eq!(cache.touch(3), None);
        assert_eq!(cache.touch(1), None);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ChunkCache::new(3);
        cache.touch(1);
        cache.touch(2);
        cache.touch(3);

        // Access chunk 1 to make it most recent
        cache.touch(1);

        assert_eq!(cache.touch(4), Some(2));
        assert_eq!(cache.touch(5), Some(3));
        assert_eq!(cache.touch(6), Some(1));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache = ChunkCache::new(0);
        assert_eq!(cache.touch(1), None);
        assert_eq!(cache.touch(2), Some(1));
    }

    #[test]
    fn test_counters() {
        let cache = ChunkCache::new(2);
        cache.record_hit();
        cache.record_hit();
        cache.record_miss();
        cache.record_read();
        cache.record_write();
        cache.touch(9);

        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.chunk_reads, 1);
        assert_eq!(stats.chunk_writes, 1);
        assert_eq!(stats.resident_chunks, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge() {
        let a = ChunkStats {
            cache_hits: 1,
            cache_misses: 2,
            chunk_reads: 3,
            chunk_writes: 4,
            resident_chunks: 5,
        };
        let sum = a.merge(&a);
        assert_eq!(sum.cache_hits, 2);
        assert_eq!(sum.resident_chunks, 10);
    }
}
