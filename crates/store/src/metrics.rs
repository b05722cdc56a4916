use cache::CacheStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store-side counters, updated with relaxed atomics on the hot path.
#[derive(Debug, Default)]
pub(crate) struct StoreMetrics {
    pub batches: AtomicU64,
    pub ops: AtomicU64,
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub backpressure_waits: AtomicU64,
}

impl StoreMetrics {
    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache: CacheStats) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            ops: self.ops.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            cache,
        }
    }

    pub fn reset(&self) {
        self.batches.store(0, Ordering::Relaxed);
        self.ops.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
        self.compactions.store(0, Ordering::Relaxed);
        self.backpressure_waits.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the store counters plus the block cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub ops: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub backpressure_waits: u64,
    pub cache: CacheStats,
}
