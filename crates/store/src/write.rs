//! Write path: batch commit, memtable flush, and backpressure.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wal::WalRecord;

use sstable::{TableReader, TableWriter};

use crate::collection::{BatchOp, CollectionCore};
use crate::crash;
use crate::error::{Result, StoreError};
use crate::index::{IndexDef, Projector};
use crate::keys;
use crate::metrics::StoreMetrics;
use crate::{StoreInner, WriterState};

/// Debt level above which writers start to yield.
const BACKPRESSURE_DEBT_BYTES: u64 = 512 * 1024;

/// Upper bound on a single cooperative backpressure delay.
const BACKPRESSURE_MAX_MICROS: u64 = 5_000;

impl StoreInner {
    /// Commits a batch: validate → allocate sequences → WAL → fsync →
    /// memtable + collection hooks → maybe flush.
    ///
    /// Returns the last sequence of the batch. A failure before the WAL sync
    /// leaves no durable effect; the batch is never partially applied.
    pub(crate) fn commit(self: &Arc<Self>, ops: Vec<BatchOp>, guard: Option<u64>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(self.seq.load(Ordering::SeqCst));
        }

        self.backpressure();

        let mut w = self.writer.lock();

        if let Some(required) = guard {
            let current = self.seq.load(Ordering::SeqCst);
            if current < required {
                return Err(StoreError::SequenceTooLow { required, current });
            }
        }

        // Resolve the collection core for every op before touching anything.
        let cores: Vec<Arc<CollectionCore>> = {
            let map = self.collections.read();
            ops.iter()
                .map(|op| {
                    map.get(&op.collection)
                        .cloned()
                        .ok_or_else(|| StoreError::NotFound(format!("collection {:?}", op.collection)))
                })
                .collect::<Result<_>>()?
        };

        // Unique-constraint validation per collection, under the batch's
        // cumulative effect.
        let mut by_collection: BTreeMap<&str, (Arc<CollectionCore>, Vec<&BatchOp>)> =
            BTreeMap::new();
        for (op, core) in ops.iter().zip(&cores) {
            by_collection
                .entry(op.collection.as_str())
                .or_insert_with(|| (core.clone(), Vec::new()))
                .1
                .push(op);
        }
        for (core, group) in by_collection.values() {
            core.validate_batch(group)?;
        }

        // Contiguous sequence allocation: one per op, none for BEGIN/COMMIT.
        let n = ops.len() as u64;
        let first = self.seq.fetch_add(n, Ordering::SeqCst) + 1;

        crash::hit("wal_append")?;
        if let [op] = ops.as_slice() {
            // Single-operation writes use the legacy single-frame record.
            w.wal.append(
                first,
                &WalRecord::Op {
                    key: keys::encode_base(&op.collection, &op.id_json),
                    value: op.value.clone(),
                },
            )?;
        } else {
            let txid = Uuid::new_v4();
            w.wal.append(0, &WalRecord::Begin { txid })?;
            for (i, op) in ops.iter().enumerate() {
                w.wal.append(
                    first + i as u64,
                    &WalRecord::TxOp {
                        txid,
                        key: keys::encode_base(&op.collection, &op.id_json),
                        value: op.value.clone(),
                    },
                )?;
            }
            w.wal.append(0, &WalRecord::Commit { txid })?;
        }
        crash::hit("wal_fsync")?;
        w.wal.sync()?;

        // The batch is durable; apply it to memory.
        for (i, (op, core)) in ops.iter().zip(&cores).enumerate() {
            let seq = first + i as u64;
            w.mem.put(
                keys::encode_base(&op.collection, &op.id_json),
                op.value.clone(),
                seq,
            );
            core.apply(op, seq);
        }

        StoreMetrics::incr(&self.metrics.batches, 1);
        StoreMetrics::incr(&self.metrics.ops, n);
        tracing::debug!(ops = n, first_seq = first, "committed batch");

        if w.mem.is_over_limit() {
            self.flush_locked(&mut w)?;
        }
        Ok(first + n - 1)
    }

    /// Flushes the memtable into a new table and swaps the manifest.
    /// Caller holds the commit lock.
    pub(crate) fn flush_locked(self: &Arc<Self>, w: &mut WriterState) -> Result<()> {
        crash::hit("memtable_flush")?;
        if w.mem.is_empty() {
            return Ok(());
        }

        let entries = w.mem.drain();
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|e| {
                (
                    keys::encode_versioned(&e.key, e.seq),
                    e.value.clone().unwrap_or_default(),
                )
            })
            .collect();
        rows.sort();

        let table_id = Uuid::new_v4();
        let filename = format!("{}.sst", table_id);
        let table_path = self.path.join(&filename);
        TableWriter::write_sorted(&table_path, rows.len(), rows)?;

        crash::hit("manifest_save")?;
        let current = self.seq.load(Ordering::SeqCst);
        w.manifest.data.sequence = current;
        w.manifest.data.tables.insert(table_id, filename);
        w.manifest.save()?;
        self.manifest_seq.store(current, Ordering::SeqCst);

        let reader = TableReader::open(&table_path, table_id, self.cache.clone())?;
        self.tables.write().insert(table_id, Arc::new(reader));

        w.wal.gc(current)?;
        w.mem.notify_flush(&entries);

        StoreMetrics::incr(&self.metrics.flushes, 1);
        tracing::info!(
            table = %table_id,
            entries = entries.len(),
            sequence = current,
            "flushed memtable"
        );

        if self.opts.auto_compact {
            self.schedule_compaction();
        }
        Ok(())
    }

    /// Cooperative writer delay proportional to compaction debt.
    pub(crate) fn backpressure(&self) {
        let status = self.compactor.status(self);
        if status.debt_bytes > BACKPRESSURE_DEBT_BYTES {
            let micros = (status.debt_bytes / 1024).min(BACKPRESSURE_MAX_MICROS);
            StoreMetrics::incr(&self.metrics.backpressure_waits, 1);
            tracing::debug!(debt_bytes = status.debt_bytes, micros, "write backpressure");
            std::thread::sleep(Duration::from_micros(micros));
        }
    }

    /// Persists an index definition in the catalog (when `persist`) and
    /// registers its state on the collection, backfilled from history heads.
    pub(crate) fn register_index(
        self: &Arc<Self>,
        core: &Arc<CollectionCore>,
        def: IndexDef,
        projector: Projector,
        persist: bool,
    ) -> Result<()> {
        if persist {
            let mut w = self.writer.lock();
            let defs = w
                .manifest
                .data
                .index_catalog
                .entry(core.name.clone())
                .or_default();
            defs.retain(|d| d.name != def.name);
            defs.push(def.clone());
            w.manifest.save()?;
        }
        core.define_index(def, projector);
        Ok(())
    }

    /// Kicks a background compaction tick on a dedicated thread.
    pub(crate) fn schedule_compaction(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("tidepool-compact".to_string())
            .spawn(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.compactor.tick(&inner) {
                        tracing::warn!(error = %e, "background compaction failed");
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "could not spawn compaction thread");
        }
    }
}
