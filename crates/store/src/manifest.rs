//! Atomic catalog of live tables, the last durable sequence, and index
//! definitions.
//!
//! The manifest is JSON on disk for readability; the format is part of the
//! external interface:
//!
//! ```json
//! {"sequence": 12, "tables": {"<uuid>": "<uuid>.sst"}, "indexCatalog":
//!  {"docs": [{"name": "email", "kind": "unique", "field": ".email"}]}}
//! ```
//!
//! Writes are atomic: serialize to `MANIFEST.json.tmp`, unlink any prior
//! `MANIFEST.json`, rename the temp file into place. Readers therefore see
//! either the old or the new `(sequence, tables)` pair, never a partial
//! state. A missing manifest yields the initial empty state; one that fails
//! to decode is a fatal [`StoreError::Corrupt`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::index::IndexDef;

/// Name of the manifest file within the store directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST.json";

const MANIFEST_TMP_FILENAME: &str = "MANIFEST.json.tmp";

/// The manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManifestData {
    /// Last sequence durably covered by the table set: every entry
    /// materialized in SSTables has `seq ≤ sequence`.
    pub sequence: u64,
    /// Live tables: id → file name relative to the store directory.
    #[serde(default)]
    pub tables: BTreeMap<Uuid, String>,
    /// Secondary-index definitions per collection.
    #[serde(rename = "indexCatalog", default)]
    pub index_catalog: BTreeMap<String, Vec<IndexDef>>,
}

/// Loads and saves the manifest for one store directory.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    pub data: ManifestData,
}

impl ManifestStore {
    /// Loads `dir/MANIFEST.json`, or starts from the empty state if the file
    /// does not exist.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let data = if path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(file).map_err(|e| {
                StoreError::Corrupt(format!("manifest {}: {}", path.display(), e))
            })?
        } else {
            ManifestData::default()
        };
        Ok(Self { path, data })
    }

    /// Persists the current manifest state atomically.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);

        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            serde_json::to_writer_pretty(&mut f, &self.data).map_err(StoreError::Encoding)?;
            f.flush()?;
            f.sync_all()?;
        }

        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
