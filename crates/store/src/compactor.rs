//! Background compaction: merges overlapping tables and reports debt.
//!
//! Each tick is a single pass, guarded against re-entry. Tables get a
//! virtual level from their file size (`⌊log₂(max(1, size/256 KiB))⌋`), are
//! grouped by overlapping key range, and up to two groups are merged under a
//! two-mode policy: when L0 is under pressure (more than four L0 tables and
//! at least one L0-only overlapping group), L0-only groups go first;
//! otherwise any overlapping group qualifies. Merging keeps every distinct
//! `(key, seq)` version that a live snapshot could still observe.

use sstable::{TableReader, TableWriter};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::keys;
use crate::metrics::StoreMetrics;
use crate::StoreInner;

/// Size of a level-0 file; each level doubles.
const LEVEL_BASE_BYTES: u64 = 256 * 1024;

/// L0 table count above which debt accrues.
pub(crate) const L0_DEBT_TABLES: usize = 4;

/// Per-level table statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelInfo {
    pub level: u32,
    pub tables: usize,
    pub size_bytes: u64,
}

/// Snapshot of the compactor's view of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStatus {
    pub running: bool,
    /// Tables sitting in levels crowded enough to be merge candidates.
    pub pending_tables: usize,
    pub levels: Vec<LevelInfo>,
    /// Sum of L0 sizes beyond the four smallest; zero unless L0 holds more
    /// than four tables.
    pub debt_bytes: u64,
}

/// Virtual level of a table by file size, clamped to 0 for tiny files.
fn level_for(size_bytes: u64) -> u32 {
    (size_bytes / LEVEL_BASE_BYTES).max(1).ilog2()
}

struct Candidate {
    reader: Arc<TableReader>,
    level: u32,
    first: Vec<u8>,
    last: Vec<u8>,
}

pub(crate) struct Compactor {
    running: AtomicBool,
}

impl Compactor {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }

    /// Cheap status used by backpressure on every write admission.
    pub fn status(&self, inner: &StoreInner) -> CompactionStatus {
        let tables = inner.tables.read();

        let mut by_level: BTreeMap<u32, (usize, u64)> = BTreeMap::new();
        let mut l0_sizes: Vec<u64> = Vec::new();
        for reader in tables.values() {
            let size = reader.size_bytes();
            let level = level_for(size);
            let slot = by_level.entry(level).or_insert((0, 0));
            slot.0 += 1;
            slot.1 += size;
            if level == 0 {
                l0_sizes.push(size);
            }
        }

        let debt_bytes = if l0_sizes.len() > L0_DEBT_TABLES {
            l0_sizes.sort_unstable();
            l0_sizes[L0_DEBT_TABLES..].iter().sum()
        } else {
            0
        };

        CompactionStatus {
            running: self.running.load(Ordering::SeqCst),
            pending_tables: by_level
                .values()
                .filter(|(count, _)| *count > 1)
                .map(|(count, _)| count)
                .sum(),
            levels: by_level
                .into_iter()
                .map(|(level, (tables, size_bytes))| LevelInfo {
                    level,
                    tables,
                    size_bytes,
                })
                .collect(),
            debt_bytes,
        }
    }

    /// Runs one compaction pass. Concurrent ticks collapse into one.
    pub fn tick(&self, inner: &StoreInner) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.tick_inner(inner);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn tick_inner(&self, inner: &StoreInner) -> Result<()> {
        let tables: Vec<Arc<TableReader>> = inner.tables.read().values().cloned().collect();
        if tables.len() < 2 {
            return Ok(());
        }

        let mut candidates = Vec::with_capacity(tables.len());
        for reader in tables {
            let level = level_for(reader.size_bytes());
            let (first, last) = reader.key_range()?;
            candidates.push(Candidate {
                reader,
                level,
                first,
                last,
            });
        }
        candidates.sort_by(|a, b| a.first.cmp(&b.first));

        // Group tables whose key ranges overlap.
        let mut groups: Vec<Vec<Candidate>> = Vec::new();
        let mut group_max: Vec<u8> = Vec::new();
        for cand in candidates {
            match groups.last_mut() {
                Some(group) if cand.first <= group_max => {
                    if cand.last > group_max {
                        group_max = cand.last.clone();
                    }
                    group.push(cand);
                }
                _ => {
                    group_max = cand.last.clone();
                    groups.push(vec![cand]);
                }
            }
        }

        let l0_count = groups
            .iter()
            .flatten()
            .filter(|c| c.level == 0)
            .count();

        let mut mergeable: Vec<Vec<Candidate>> =
            groups.into_iter().filter(|g| g.len() > 1).collect();

        let all_l0 = |group: &Vec<Candidate>| group.iter().all(|c| c.level == 0);
        if l0_count > L0_DEBT_TABLES && mergeable.iter().any(all_l0) {
            mergeable.retain(all_l0);
        }

        let group_bytes =
            |group: &Vec<Candidate>| group.iter().map(|c| c.reader.size_bytes()).sum::<u64>();
        mergeable.sort_by_key(|g| Reverse(group_bytes(g)));
        mergeable.truncate(2);

        for group in mergeable {
            self.merge_group(inner, group)?;
            StoreMetrics::incr(&inner.metrics.compactions, 1);
        }
        Ok(())
    }

    /// Merges one overlapping group into a single new table, swaps the
    /// manifest, and retires the inputs.
    fn merge_group(&self, inner: &StoreInner, group: Vec<Candidate>) -> Result<()> {
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for cand in &group {
            for row in cand.reader.scan() {
                rows.push(row?);
            }
        }

        // Stable sort, then last-in-wins for exact key duplicates (the same
        // (key, seq) version present in several input tables).
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(rows.len());
        for row in rows {
            match merged.last_mut() {
                Some(last) if last.0 == row.0 => *last = row,
                _ => merged.push(row),
            }
        }

        let min_snapshot = inner.snapshots.min();
        let manifest_seq = inner.manifest_seq.load(Ordering::SeqCst);
        let rows = retain_versions(merged, min_snapshot, manifest_seq);

        let old_ids: Vec<Uuid> = group.iter().map(|c| c.reader.id()).collect();
        let input_tables = group.len();

        let new_table = if rows.is_empty() {
            None
        } else {
            let id = Uuid::new_v4();
            let filename = format!("{}.sst", id);
            let path = inner.path.join(&filename);
            TableWriter::write_sorted(&path, rows.len(), rows)?;
            let reader = TableReader::open(&path, id, inner.cache.clone())?;
            Some((id, filename, Arc::new(reader)))
        };

        // Manifest swap and table-set update happen under the store's
        // serialization point.
        {
            let mut w = inner.writer.lock();

            // A restore may have swapped the table set since this group was
            // chosen; merging retired inputs would resurrect stale data.
            if !old_ids
                .iter()
                .all(|id| w.manifest.data.tables.contains_key(id))
            {
                drop(w);
                if let Some((_, filename, _)) = &new_table {
                    let _ = std::fs::remove_file(inner.path.join(filename));
                }
                return Ok(());
            }

            for id in &old_ids {
                w.manifest.data.tables.remove(id);
            }
            if let Some((id, filename, _)) = &new_table {
                w.manifest.data.tables.insert(*id, filename.clone());
            }
            w.manifest.save()?;

            let mut tables = inner.tables.write();
            for id in &old_ids {
                tables.remove(id);
            }
            if let Some((id, _, reader)) = &new_table {
                tables.insert(*id, reader.clone());
            }
        }

        // Retire the inputs. Readers that still hold the old Arcs finish
        // against the unlinked files.
        drop(group);
        for id in &old_ids {
            let _ = std::fs::remove_file(inner.path.join(format!("{}.sst", id)));
        }

        tracing::info!(
            inputs = input_tables,
            output = ?new_table.as_ref().map(|(id, ..)| id.to_string()),
            "compacted table group"
        );
        Ok(())
    }
}

/// Applies the snapshot retention policy to a merged, key-sorted run.
///
/// With a live snapshot at `min_snapshot`, a version may be dropped only if
/// a newer version of the same id exists with `seq ≤ min_snapshot`. With no
/// live snapshot, only fully-tombstoned ids whose latest version is already
/// covered by the manifest are coalesced away.
fn retain_versions(
    rows: Vec<(Vec<u8>, Vec<u8>)>,
    min_snapshot: Option<u64>,
    manifest_seq: u64,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::with_capacity(rows.len());
    let mut group: Vec<(Vec<u8>, Vec<u8>, u64)> = Vec::new();
    let mut group_base: Option<(String, Vec<u8>)> = None;

    let flush_group = |group: &mut Vec<(Vec<u8>, Vec<u8>, u64)>,
                       out: &mut Vec<(Vec<u8>, Vec<u8>)>| {
        if group.is_empty() {
            return;
        }
        match min_snapshot {
            Some(min_snap) => {
                // Keep the newest version at or below the snapshot floor,
                // plus everything above it.
                let floor = group
                    .iter()
                    .filter(|(.., seq)| *seq <= min_snap)
                    .map(|(.., seq)| *seq)
                    .max();
                for (key, value, seq) in group.drain(..) {
                    if seq > min_snap || Some(seq) == floor {
                        out.push((key, value));
                    }
                }
            }
            None => {
                let (_, last_value, last_seq) = group.last().expect("non-empty group");
                let fully_dead = last_value.is_empty() && *last_seq <= manifest_seq;
                if !fully_dead {
                    for (key, value, _) in group.drain(..) {
                        out.push((key, value));
                    }
                } else {
                    group.clear();
                }
            }
        }
    };

    for (key, value) in rows {
        let decoded = keys::decode(&key);
        let base = decoded
            .as_ref()
            .map(|d| (d.collection.clone(), d.id_json.clone()));
        let seq = decoded.and_then(|d| d.seq).unwrap_or(0);

        if base != group_base || base.is_none() {
            flush_group(&mut group, &mut out);
            group_base = base;
        }
        group.push((key, value, seq));
    }
    flush_group(&mut group, &mut out);
    out
}
