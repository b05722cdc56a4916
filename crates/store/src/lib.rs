//! # Store — the tidepool storage engine
//!
//! An embedded, ACID key-value engine organized as a log-structured merge
//! tree. Typed documents live in named collections; every write is journaled
//! to the WAL before it touches memory, the memtable flushes into immutable
//! sorted tables, and a background compactor merges overlapping tables.
//! Multi-version concurrency gives snapshot reads that survive restarts,
//! because table keys embed the commit sequence.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!   |
//!   v
//! ┌───────────────────────────────────────────────────┐
//! │                     STORE                         │
//! │                                                   │
//! │ batch → validate unique → allocate seqs           │
//! │   → WAL BEGIN/OP…/COMMIT + fsync                  │
//! │   → memtable + collection hooks                   │
//! │        |        (over limit?)                     │
//! │        v              yes                         │
//! │     flush() → UUID.sst + manifest swap → WAL GC   │
//! │        |                                          │
//! │        v                                          │
//! │  background compaction (two-mode, debt-driven)    │
//! │                                                   │
//! │ read → collection history (bootstrapped at open)  │
//! │        tables feed history via bootstrap buffers  │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Crash Safety
//!
//! A batch is durable once its frames and COMMIT are fsynced; replay heals a
//! crash between WAL sync and memtable apply. A crash between table write
//! and manifest save re-executes the flush from the WAL on the next open.
//! Manifests swap atomically; tables are immutable once published.

mod backup;
mod collection;
mod compactor;
mod crash;
mod docs;
mod error;
mod index;
mod keypath;
mod keys;
mod manifest;
mod metrics;
mod recovery;
mod snapshot;
mod write;

use cache::BlockCache;
use memtable::Memtable;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use wal::WalWriter;

pub use backup::BackupRef;
pub use cache::CacheStats;
pub use collection::{Batch, Collection, Document};
pub use compactor::{CompactionStatus, LevelInfo};
pub use docs::{DocCollection, JsonDoc};
pub use error::{Result, StoreError};
pub use index::{IndexDef, IndexKind};
pub use keypath::KeyPath;
pub use metrics::MetricsSnapshot;
pub use snapshot::Snapshot;

use collection::CollectionCore;
use compactor::Compactor;
use docs::keypath_projector;
use manifest::ManifestStore;
use metrics::StoreMetrics;
use snapshot::SnapshotRegistry;

/// Name of the active WAL file within the store directory.
pub const WAL_FILENAME: &str = "wal.log";

/// Configuration for [`Store::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    /// Block cache capacity in bytes. Zero disables caching.
    pub cache_bytes: usize,
    /// Default `limit` for scans that do not pass one.
    pub default_scan_limit: usize,
    /// WAL segment rotation threshold in bytes. Zero disables rotation.
    pub wal_segment_bytes: u64,
    /// Memtable entry count that triggers a flush.
    pub memtable_limit: usize,
    /// Schedule a background compaction tick after each flush. Disable to
    /// drive compaction manually through [`Store::compact_now`].
    pub auto_compact: bool,
}

impl StoreOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_bytes: 64 * 1024 * 1024,
            default_scan_limit: 100,
            wal_segment_bytes: 4 * 1024 * 1024,
            memtable_limit: memtable::DEFAULT_LIMIT,
            auto_compact: true,
        }
    }
}

/// Mutating state serialized by the commit lock.
pub(crate) struct WriterState {
    pub wal: WalWriter,
    pub mem: Memtable,
    pub manifest: ManifestStore,
}

/// Shared engine state. `Store` and collection handles hold `Arc`/`Weak`
/// references to it.
pub(crate) struct StoreInner {
    pub opts: StoreOptions,
    pub path: PathBuf,
    pub cache: Arc<BlockCache>,
    pub metrics: StoreMetrics,
    /// The commit lock: every mutating operation serializes through it.
    pub writer: Mutex<WriterState>,
    /// Live table set, swapped under the commit lock, read lock-free-ish by
    /// readers and the compactor.
    pub tables: RwLock<HashMap<Uuid, Arc<sstable::TableReader>>>,
    pub collections: RwLock<HashMap<String, Arc<CollectionCore>>>,
    /// Per-collection recovered versions, consumed when a collection is
    /// first materialized.
    pub bootstrap: Mutex<recovery::BootstrapMap>,
    /// Last allocated sequence.
    pub seq: AtomicU64,
    /// Last sequence durably covered by the manifest's table set.
    pub manifest_seq: AtomicU64,
    pub snapshots: Arc<SnapshotRegistry>,
    pub compactor: Compactor,
}

impl StoreInner {
    /// Returns the cached collection core, creating and bootstrapping it on
    /// first access. Dynamically-defined (key-path) indexes from the catalog
    /// are re-registered here, so they are rebuilt after restart without any
    /// caller involvement.
    pub(crate) fn get_or_create_core(self: &Arc<Self>, name: &str) -> Arc<CollectionCore> {
        if let Some(core) = self.collections.read().get(name) {
            return core.clone();
        }

        // Commit lock before the collections write lock, always.
        let catalog_defs: Vec<IndexDef> = {
            let w = self.writer.lock();
            w.manifest
                .data
                .index_catalog
                .get(name)
                .cloned()
                .unwrap_or_default()
        };

        let mut map = self.collections.write();
        if let Some(core) = map.get(name) {
            return core.clone();
        }

        let core = Arc::new(CollectionCore::new(name.to_string()));
        if let Some(entries) = self.bootstrap.lock().remove(name) {
            core.ingest_bootstrap(entries);
        }
        for def in catalog_defs {
            if let Some(field) = &def.field {
                match KeyPath::parse(field) {
                    Ok(path) => core.define_index(def.clone(), keypath_projector(&def, path)),
                    Err(e) => {
                        tracing::warn!(collection = name, index = %def.name, error = %e, "skipping catalog index with bad key path");
                    }
                }
            }
        }
        map.insert(name.to_string(), core.clone());
        core
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // The WAL already covers everything in the memtable; a final sync is
        // all that is needed for a clean shutdown.
        let _ = self.writer.get_mut().wal.sync();
    }
}

/// Handle to an open store. Cheap to clone; the engine shuts down when the
/// last handle (and every collection handle) is gone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (or creates) a store at `opts.path`, recovering state from the
    /// manifest, the tables it references, and the WAL.
    pub fn open(opts: StoreOptions) -> Result<Store> {
        fs::create_dir_all(&opts.path)?;
        recovery::cleanup_tmp_files(&opts.path);

        let manifest = ManifestStore::load_or_create(&opts.path)?;
        let manifest_seq = manifest.data.sequence;
        let cache = Arc::new(BlockCache::new(opts.cache_bytes));

        let (tables, mut bootstrap, table_seq) =
            recovery::load_tables(&opts.path, &manifest.data, &cache)?;

        let wal_path = opts.path.join(WAL_FILENAME);
        let mut mem = Memtable::new(opts.memtable_limit);
        let wal_seq = recovery::replay_wal(&wal_path, manifest_seq, &mut mem, &mut bootstrap)?;
        let wal = WalWriter::open(&wal_path, opts.wal_segment_bytes)?;

        let seq = manifest_seq.max(table_seq).max(wal_seq);
        tracing::info!(
            path = %opts.path.display(),
            sequence = seq,
            tables = tables.len(),
            pending = mem.len(),
            "store opened"
        );

        // Catalog collections that carry key-path index definitions get
        // materialized now, so their indexes are rebuilt right after
        // bootstrap.
        let catalog_driven: Vec<String> = manifest
            .data
            .index_catalog
            .iter()
            .filter(|(_, defs)| defs.iter().any(|d| d.field.is_some()))
            .map(|(name, _)| name.clone())
            .collect();

        let path = opts.path.clone();
        let inner = Arc::new(StoreInner {
            opts,
            path,
            cache,
            metrics: StoreMetrics::default(),
            writer: Mutex::new(WriterState { wal, mem, manifest }),
            tables: RwLock::new(tables),
            collections: RwLock::new(HashMap::new()),
            bootstrap: Mutex::new(bootstrap),
            seq: AtomicU64::new(seq),
            manifest_seq: AtomicU64::new(manifest_seq),
            snapshots: Arc::new(SnapshotRegistry::default()),
            compactor: Compactor::new(),
        });

        for name in catalog_driven {
            inner.get_or_create_core(&name);
        }

        Ok(Store { inner })
    }

    /// Returns the typed handle for a collection, creating it on first use.
    pub fn collection<T: Document>(&self, name: &str) -> Collection<T> {
        Collection {
            core: self.inner.get_or_create_core(name),
            store: Arc::downgrade(&self.inner),
            _marker: std::marker::PhantomData,
        }
    }

    /// Returns the untyped document collection for `name`.
    pub fn documents(&self, name: &str) -> DocCollection {
        DocCollection {
            inner: self.collection::<JsonDoc>(name),
        }
    }

    /// Names of every known collection: materialized, pending bootstrap, or
    /// present in the index catalog.
    pub fn list_collections(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.inner.collections.read().keys().cloned().collect();
        names.extend(self.inner.bootstrap.lock().keys().cloned());
        names.extend(
            self.inner
                .writer
                .lock()
                .manifest
                .data
                .index_catalog
                .keys()
                .cloned(),
        );
        names.into_iter().collect()
    }

    /// Removes a collection from the catalog and the in-memory map. Records
    /// remain in the tables until overwritten or compacted.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        {
            let mut w = self.inner.writer.lock();
            if w.manifest.data.index_catalog.remove(name).is_some() {
                w.manifest.save()?;
            }
        }
        self.inner.collections.write().remove(name);
        self.inner.bootstrap.lock().remove(name);
        Ok(())
    }

    /// Commits a transactional batch across any mix of collections.
    /// Returns the last sequence of the batch.
    pub fn batch(&self, batch: Batch) -> Result<u64> {
        self.inner.commit(batch.ops, None)
    }

    /// Like [`batch`](Store::batch), but fails with
    /// [`StoreError::SequenceTooLow`] unless the store has reached
    /// `require_sequence_at_least`.
    pub fn batch_with_guard(&self, batch: Batch, require_sequence_at_least: u64) -> Result<u64> {
        self.inner.commit(batch.ops, Some(require_sequence_at_least))
    }

    /// Takes a snapshot at the current sequence.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.inner.seq.load(Ordering::SeqCst),
            self.inner.snapshots.clone(),
        )
    }

    /// The last allocated sequence.
    pub fn sequence(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    /// Forces a memtable flush, if it holds anything.
    pub fn flush(&self) -> Result<()> {
        let mut w = self.inner.writer.lock();
        self.inner.flush_locked(&mut w)
    }

    /// Runs one synchronous compaction tick.
    pub fn compact_now(&self) -> Result<()> {
        self.inner.compactor.tick(&self.inner)
    }

    pub fn compaction_status(&self) -> CompactionStatus {
        self.inner.compactor.status(&self.inner)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(self.inner.cache.stats())
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
        self.inner.cache.reset_stats();
    }

    /// Creates a backup bundle under `backups/<uuid>/`.
    pub fn create_backup(&self, note: Option<&str>) -> Result<BackupRef> {
        self.inner.create_backup(note)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupRef>> {
        self.inner.list_backups()
    }

    /// Restores the state captured by backup `id`.
    pub fn restore_backup(&self, id: Uuid) -> Result<()> {
        self.inner.restore_backup(id)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("sequence", &self.inner.seq.load(Ordering::SeqCst))
            .field("tables", &self.inner.tables.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
