use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A read view bound to a sequence number.
///
/// Reads through a snapshot return, per key, the latest version with
/// `seq ≤ sequence`. Snapshots register themselves in the store's snapshot
/// registry for their lifetime, which keeps compaction from discarding
/// versions a live snapshot could still observe. A snapshot survives only
/// the process, but its sequence stays meaningful across restarts because
/// SSTable keys embed sequences.
#[derive(Debug)]
pub struct Snapshot {
    seq: u64,
    registry: Arc<SnapshotRegistry>,
}

impl Snapshot {
    pub(crate) fn new(seq: u64, registry: Arc<SnapshotRegistry>) -> Self {
        registry.register(seq);
        Self { seq, registry }
    }

    /// The sequence this snapshot reads at.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Self::new(self.seq, self.registry.clone())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.deregister(self.seq);
    }
}

/// Reference-counted registry of live snapshot sequences.
#[derive(Debug, Default)]
pub(crate) struct SnapshotRegistry {
    live: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotRegistry {
    fn register(&self, seq: u64) {
        *self.live.lock().entry(seq).or_insert(0) += 1;
    }

    fn deregister(&self, seq: u64) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                live.remove(&seq);
            }
        }
    }

    /// The smallest live snapshot sequence, if any snapshot is registered.
    pub fn min(&self) -> Option<u64> {
        self.live.lock().keys().next().copied()
    }
}
