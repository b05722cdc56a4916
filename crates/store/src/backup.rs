//! Backup bundles: quiesce, copy, restore.
//!
//! A backup lives under `backups/<uuid>/` next to the store files: the
//! manifest, the active WAL copied verbatim, every table the manifest
//! references, and a `backup.json` descriptor.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::manifest::{ManifestStore, MANIFEST_FILENAME};
use crate::recovery;
use crate::{StoreInner, WAL_FILENAME};

const BACKUPS_DIR: &str = "backups";
const BACKUP_META: &str = "backup.json";

/// Descriptor of one backup bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub id: Uuid,
    /// ISO-8601 creation stamp.
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

impl StoreInner {
    /// Creates a backup bundle. The commit lock quiesces writers; the WAL is
    /// synced, the memtable flushed, and the resulting file set copied.
    pub(crate) fn create_backup(self: &Arc<Self>, note: Option<&str>) -> Result<BackupRef> {
        let mut w = self.writer.lock();
        w.wal.sync()?;
        self.flush_locked(&mut w)?;
        w.wal.sync()?;

        // A store that has never flushed has no manifest on disk yet.
        if !self.path.join(MANIFEST_FILENAME).exists() {
            w.manifest.save()?;
        }

        let id = Uuid::new_v4();
        let dir = self.path.join(BACKUPS_DIR).join(id.to_string());
        fs::create_dir_all(&dir)?;

        let mut size_bytes = 0u64;
        size_bytes += fs::copy(
            self.path.join(MANIFEST_FILENAME),
            dir.join(MANIFEST_FILENAME),
        )?;
        size_bytes += fs::copy(self.path.join(WAL_FILENAME), dir.join(WAL_FILENAME))?;
        for filename in w.manifest.data.tables.values() {
            size_bytes += fs::copy(self.path.join(filename), dir.join(filename))?;
        }

        let backup = BackupRef {
            id,
            created_at: chrono::Utc::now().to_rfc3339(),
            note: note.map(str::to_string),
            size_bytes,
        };
        serde_json::to_writer_pretty(File::create(dir.join(BACKUP_META))?, &backup)
            .map_err(StoreError::Encoding)?;

        tracing::info!(backup = %id, size_bytes, "created backup");
        Ok(backup)
    }

    /// Enumerates backup bundles, oldest first.
    pub(crate) fn list_backups(&self) -> Result<Vec<BackupRef>> {
        let dir = self.path.join(BACKUPS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let meta_path = entry?.path().join(BACKUP_META);
            if !meta_path.exists() {
                continue;
            }
            match serde_json::from_reader(File::open(&meta_path)?) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    tracing::warn!(path = %meta_path.display(), error = %e, "skipping unreadable backup descriptor");
                }
            }
        }
        backups.sort_by(|a: &BackupRef, b: &BackupRef| a.created_at.cmp(&b.created_at));
        Ok(backups)
    }

    /// Restores the store to the state captured in backup `id`.
    ///
    /// The current table set is dropped and deleted, the backup's tables and
    /// manifest are copied into place (ids, sequence, and index catalog
    /// preserved), the active WAL is replaced verbatim, and the in-memory
    /// state is re-bootstrapped exactly as on open.
    pub(crate) fn restore_backup(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let backup_dir = self.path.join(BACKUPS_DIR).join(id.to_string());
        if !backup_dir.join(BACKUP_META).exists() {
            return Err(StoreError::NotFound(format!("backup {}", id)));
        }

        let mut w = self.writer.lock();

        // Retire the current table set.
        self.tables.write().clear();
        self.cache.clear();
        let old_files: Vec<String> = w.manifest.data.tables.values().cloned().collect();
        for filename in old_files {
            let _ = fs::remove_file(self.path.join(filename));
        }

        // Copy the backup's tables into the store path.
        for entry in fs::read_dir(&backup_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "sst") {
                let name = path.file_name().expect("sst file name");
                fs::copy(&path, self.path.join(name))?;
            }
        }

        // Adopt the backup's manifest: table ids, sequence, index catalog.
        let backup_manifest = ManifestStore::load_or_create(&backup_dir)?;
        w.manifest.data = backup_manifest.data;
        w.manifest.save()?;

        // Replace the active WAL verbatim; rotated segments from the current
        // timeline would replay state the backup never saw.
        let wal_path = self.path.join(WAL_FILENAME);
        for segment in wal::segment_paths(&wal_path)? {
            let _ = fs::remove_file(segment);
        }
        fs::copy(backup_dir.join(WAL_FILENAME), &wal_path)?;
        w.wal = wal::WalWriter::open(&wal_path, self.opts.wal_segment_bytes)?;

        // Re-bootstrap in-memory state from the restored files.
        w.mem = memtable::Memtable::new(self.opts.memtable_limit);
        let (tables, mut bootstrap, table_seq) =
            recovery::load_tables(&self.path, &w.manifest.data, &self.cache)?;
        *self.tables.write() = tables;
        self.manifest_seq
            .store(w.manifest.data.sequence, Ordering::SeqCst);
        let wal_seq = recovery::replay_wal(
            &wal_path,
            w.manifest.data.sequence,
            &mut w.mem,
            &mut bootstrap,
        )?;
        self.seq.store(
            w.manifest.data.sequence.max(table_seq).max(wal_seq),
            Ordering::SeqCst,
        );

        // Reset materialized collections and feed them the restored state.
        let cores: Vec<_> = self.collections.read().values().cloned().collect();
        for core in cores {
            core.reset();
            if let Some(entries) = bootstrap.remove(&core.name) {
                core.ingest_bootstrap(entries);
            }
            core.rebuild_indexes();
        }
        *self.bootstrap.lock() = bootstrap;

        tracing::info!(backup = %id, sequence = self.seq.load(Ordering::SeqCst), "restored backup");
        Ok(())
    }
}
