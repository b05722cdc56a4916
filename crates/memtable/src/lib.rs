//! In-memory sorted buffer of pending writes.
//!
//! Unlike a last-write-wins map, the memtable keeps **every** version: entries
//! are keyed by `(base key, sequence)`, so a snapshot taken between two puts
//! of the same key can still read the older version before the next flush.
//! `value == None` signifies a tombstone (delete).

use std::collections::BTreeMap;
use std::ops::Bound;

/// Default number of buffered entries that makes the memtable eligible for a
/// flush.
pub const DEFAULT_LIMIT: usize = 1024;

/// One buffered write: a base key, its optional value, and the sequence the
/// write committed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub seq: u64,
}

/// Callback invoked with the drained entries after a flush has been made
/// durable.
pub type FlushCallback = Box<dyn Fn(&[MemEntry]) + Send + Sync>;

/// Sorted buffer of `(key, value?, seq)` tuples awaiting flush.
pub struct Memtable {
    /// Sorted by base key, then by sequence within a key.
    map: BTreeMap<(Vec<u8>, u64), Option<Vec<u8>>>,
    limit: usize,
    callbacks: Vec<FlushCallback>,
}

impl Memtable {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            limit: if limit == 0 { DEFAULT_LIMIT } else { limit },
            callbacks: Vec::new(),
        }
    }

    /// Buffers a write at the given sequence. Versions accumulate; an older
    /// version of the same key is never overwritten.
    pub fn put(&mut self, key: Vec<u8>, value: Option<Vec<u8>>, seq: u64) {
        self.map.insert((key, seq), value);
    }

    /// Returns the latest version of `key` with sequence ≤ `max_seq`.
    ///
    /// The outer `Option` is presence in the buffer; the inner is the value
    /// (`None` = tombstone).
    #[must_use]
    pub fn get(&self, key: &[u8], max_seq: u64) -> Option<(u64, Option<Vec<u8>>)> {
        self.map
            .range((
                Bound::Included((key.to_vec(), 0)),
                Bound::Included((key.to_vec(), max_seq)),
            ))
            .next_back()
            .map(|((_, seq), value)| (*seq, value.clone()))
    }

    /// Returns the latest buffered version of `key` regardless of sequence.
    #[must_use]
    pub fn get_latest(&self, key: &[u8]) -> Option<(u64, Option<Vec<u8>>)> {
        self.get(key, u64::MAX)
    }

    /// Iterates every buffered version whose base key starts with `prefix`,
    /// in key-then-sequence order. An empty prefix scans everything.
    pub fn scan<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = MemEntry> + 'a {
        self.map
            .range((Bound::Included((prefix.to_vec(), 0)), Bound::Unbounded))
            .take_while(move |((key, _), _)| key.starts_with(prefix))
            .map(|((key, seq), value)| MemEntry {
                key: key.clone(),
                value: value.clone(),
                seq: *seq,
            })
    }

    /// Whether the buffered entry count has reached the configured limit.
    #[must_use]
    pub fn is_over_limit(&self) -> bool {
        self.map.len() >= self.limit
    }

    /// Removes and returns all buffered entries in sorted order.
    pub fn drain(&mut self) -> Vec<MemEntry> {
        let map = std::mem::take(&mut self.map);
        map.into_iter()
            .map(|((key, seq), value)| MemEntry { key, value, seq })
            .collect()
    }

    /// Registers a hook invoked with the drained entries once a flush is
    /// durable.
    pub fn on_flush(&mut self, cb: FlushCallback) {
        self.callbacks.push(cb);
    }

    /// Invokes every registered flush hook with `entries`.
    pub fn notify_flush(&self, entries: &[MemEntry]) {
        for cb in &self.callbacks {
            cb(entries);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("entries", &self.map.len())
            .field("limit", &self.limit)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn put_get_delete() {
        let mut m = Memtable::new(1024);
        m.put(b"k1".to_vec(), Some(b"v1".to_vec()), 1);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get_latest(b"k1").unwrap().1, Some(b"v1".to_vec()));

        // newer put adds a version, does not replace
        m.put(b"k1".to_vec(), Some(b"v2".to_vec()), 2);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_latest(b"k1").unwrap().1, Some(b"v2".to_vec()));

        // tombstone is the latest version
        m.put(b"k1".to_vec(), None, 3);
        assert_eq!(m.get_latest(b"k1").unwrap().1, None);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn get_respects_sequence_bound() {
        let mut m = Memtable::new(1024);
        m.put(b"k".to_vec(), Some(b"v1".to_vec()), 5);
        m.put(b"k".to_vec(), Some(b"v2".to_vec()), 9);

        assert_eq!(m.get(b"k", 4), None);
        assert_eq!(m.get(b"k", 5).unwrap(), (5, Some(b"v1".to_vec())));
        assert_eq!(m.get(b"k", 8).unwrap(), (5, Some(b"v1".to_vec())));
        assert_eq!(m.get(b"k", 9).unwrap(), (9, Some(b"v2".to_vec())));
    }

    #[test]
    fn scan_filters_by_prefix_in_order() {
        let mut m = Memtable::new(1024);
        m.put(b"a/1".to_vec(), Some(b"x".to_vec()), 1);
        m.put(b"b/1".to_vec(), Some(b"y".to_vec()), 2);
        m.put(b"a/2".to_vec(), Some(b"z".to_vec()), 3);

        let hits: Vec<MemEntry> = m.scan(b"a/").collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, b"a/1");
        assert_eq!(hits[1].key, b"a/2");

        assert_eq!(m.scan(b"").count(), 3);
    }

    #[test]
    fn over_limit_and_drain_reset() {
        let mut m = Memtable::new(3);
        assert!(!m.is_over_limit());
        for seq in 1..=3u64 {
            m.put(format!("k{}", seq).into_bytes(), Some(b"v".to_vec()), seq);
        }
        assert!(m.is_over_limit());

        let drained = m.drain();
        assert_eq!(drained.len(), 3);
        assert!(m.is_empty());
        assert!(!m.is_over_limit());

        // drained entries come out in key order
        assert_eq!(drained[0].key, b"k1");
        assert_eq!(drained[2].key, b"k3");
    }

    #[test]
    fn flush_callbacks_see_drained_entries() {
        let mut m = Memtable::new(1024);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        m.on_flush(Box::new(move |entries| {
            seen2.fetch_add(entries.len(), Ordering::SeqCst);
        }));

        m.put(b"a".to_vec(), Some(b"1".to_vec()), 1);
        m.put(b"b".to_vec(), None, 2);
        let drained = m.drain();
        m.notify_flush(&drained);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
