//! Cold-start recovery: SSTable bootstrap and WAL replay.
//!
//! Open loads every table referenced by the manifest, decoding each
//! composite key into `(collection, id, seq)` and accumulating per-collection
//! bootstrap buffers that collections consume when first materialized. The
//! WAL is then replayed on top: committed transactions and legacy single ops
//! newer than the manifest sequence land in the memtable and the same
//! bootstrap buffers. A BEGIN whose COMMIT never made it to disk contributes
//! nothing.

use cache::BlockCache;
use memtable::Memtable;
use sstable::TableReader;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use wal::WalRecord;

use crate::collection::BootstrapEntry;
use crate::error::Result;
use crate::keys;
use crate::manifest::ManifestData;

pub(crate) type BootstrapMap = HashMap<String, Vec<BootstrapEntry>>;

/// Opens every table in the manifest and materializes bootstrap buffers.
///
/// Entries whose key lacks a sequence suffix inherit the manifest sequence.
/// Returns the table set, the buffers, and the highest sequence seen.
pub(crate) fn load_tables(
    dir: &Path,
    manifest: &ManifestData,
    cache: &Arc<BlockCache>,
) -> Result<(HashMap<Uuid, Arc<TableReader>>, BootstrapMap, u64)> {
    let mut tables = HashMap::new();
    let mut bootstrap: BootstrapMap = HashMap::new();
    let mut max_seq = manifest.sequence;

    for (id, filename) in &manifest.tables {
        let path = dir.join(filename);
        let reader = TableReader::open(&path, *id, cache.clone())?;

        for row in reader.scan() {
            let (key, value) = row?;
            let Some(decoded) = keys::decode(&key) else {
                tracing::warn!(table = %id, "skipping undecodable table key");
                continue;
            };
            let seq = decoded.seq.unwrap_or(manifest.sequence);
            max_seq = max_seq.max(seq);
            bootstrap
                .entry(decoded.collection)
                .or_default()
                .push(BootstrapEntry {
                    id_json: decoded.id_json,
                    value: if value.is_empty() { None } else { Some(value) },
                    seq,
                });
        }
        tables.insert(*id, Arc::new(reader));
    }

    Ok((tables, bootstrap, max_seq))
}

/// Replays the WAL at `active` on top of the manifest state.
///
/// Frames with `seq ≤ manifest_seq` are already materialized in tables and
/// are discarded. Returns the highest sequence applied.
pub(crate) fn replay_wal(
    active: &Path,
    manifest_seq: u64,
    mem: &mut Memtable,
    bootstrap: &mut BootstrapMap,
) -> Result<u64> {
    let frames = wal::replay(active)?;
    let mut pending: HashMap<Uuid, Vec<(u64, Vec<u8>, Option<Vec<u8>>)>> = HashMap::new();
    let mut max_seq = 0u64;

    for frame in frames {
        match frame.record {
            WalRecord::Begin { txid } => {
                pending.insert(txid, Vec::new());
            }
            WalRecord::TxOp { txid, key, value } => {
                if frame.seq <= manifest_seq {
                    continue;
                }
                match pending.get_mut(&txid) {
                    Some(buffer) => buffer.push((frame.seq, key, value)),
                    // No active BEGIN for this transaction: its BEGIN was
                    // garbage-collected with an older segment, so the op is
                    // committed.
                    None => max_seq = max_seq.max(apply(frame.seq, &key, value, mem, bootstrap)),
                }
            }
            WalRecord::Commit { txid } => {
                if let Some(mut buffer) = pending.remove(&txid) {
                    buffer.sort_by_key(|(seq, ..)| *seq);
                    for (seq, key, value) in buffer {
                        max_seq = max_seq.max(apply(seq, &key, value, mem, bootstrap));
                    }
                }
            }
            WalRecord::Op { key, value } => {
                if frame.seq > manifest_seq {
                    max_seq = max_seq.max(apply(frame.seq, &key, value, mem, bootstrap));
                }
            }
        }
    }

    if !pending.is_empty() {
        tracing::warn!(
            transactions = pending.len(),
            "dropping uncommitted wal transactions"
        );
    }
    Ok(max_seq)
}

fn apply(
    seq: u64,
    key: &[u8],
    value: Option<Vec<u8>>,
    mem: &mut Memtable,
    bootstrap: &mut BootstrapMap,
) -> u64 {
    mem.put(key.to_vec(), value.clone(), seq);
    match keys::decode(key) {
        Some(decoded) => {
            bootstrap
                .entry(decoded.collection)
                .or_default()
                .push(BootstrapEntry {
                    id_json: decoded.id_json,
                    value,
                    seq,
                });
        }
        None => tracing::warn!(seq, "skipping undecodable wal key"),
    }
    seq
}

/// Removes leftover `.sst.tmp` files from interrupted flushes.
pub(crate) fn cleanup_tmp_files(dir: &Path) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".sst.tmp") || name.ends_with(".json.tmp") {
                    let _ = std::fs::remove_file(&p);
                }
            }
        }
    }
}
