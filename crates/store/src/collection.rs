//! Collections: typed views over the store.
//!
//! A collection keeps, per document id, the full version history
//! `id → [(seq, value | ⊥)]` plus one versioned map per secondary index.
//! All mutation flows through the store's batch commit, which invokes the
//! collection's validate and apply hooks; reads resolve against the
//! in-memory history, which open-time bootstrap materializes from SSTables
//! and the WAL.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::error::{Result, StoreError};
use crate::index::{visible, IndexDef, IndexKind, IndexState, Projector};
use crate::keys;
use crate::snapshot::Snapshot;
use crate::StoreInner;

/// A typed document with a JSON-encodable id.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Id: Serialize;

    fn id(&self) -> Self::Id;
}

/// One persisted version recovered during open, fed into collection history
/// when the collection is first materialized.
#[derive(Debug, Clone)]
pub(crate) struct BootstrapEntry {
    pub id_json: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub seq: u64,
}

/// One operation of a batch: a put (`value = Some`) or a delete.
#[derive(Debug, Clone)]
pub(crate) struct BatchOp {
    pub collection: String,
    pub id_json: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// A transactional multi-collection batch.
///
/// Ops commit in submission order with contiguous sequences; the whole batch
/// either becomes durable and visible or leaves no effect.
#[derive(Default)]
pub struct Batch {
    pub(crate) ops: Vec<BatchOp>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put of `doc` to the batch.
    pub fn put<T: Document>(&mut self, collection: &Collection<T>, doc: &T) -> Result<()> {
        let id_json = serde_json::to_vec(&doc.id())?;
        let value = serde_json::to_vec(doc)?;
        self.push_op(&collection.core.name, id_json, Some(value))
    }

    /// Adds a delete of `id` to the batch.
    pub fn delete<T: Document>(&mut self, collection: &Collection<T>, id: &T::Id) -> Result<()> {
        let id_json = serde_json::to_vec(id)?;
        self.push_op(&collection.core.name, id_json, None)
    }

    fn push_op(&mut self, collection: &str, id_json: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
        let base = keys::encode_base(collection, &id_json);
        if base.len() > keys::MAX_KEY_BYTES {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("encoded key too large: {} bytes", base.len()),
            )));
        }
        if let Some(v) = &value {
            if v.len() > keys::MAX_VALUE_BYTES {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("value too large: {} bytes", v.len()),
                )));
            }
        }
        self.ops.push(BatchOp {
            collection: collection.to_string(),
            id_json,
            value,
        });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Untyped per-collection state: history and indexes, shared by every typed
/// handle of the same name.
pub(crate) struct CollectionCore {
    pub name: String,
    pub state: RwLock<CollState>,
}

#[derive(Default)]
pub(crate) struct CollState {
    /// id → version list, ascending by sequence.
    pub history: BTreeMap<Vec<u8>, Vec<(u64, Option<Vec<u8>>)>>,
    pub indexes: BTreeMap<String, IndexState>,
}

impl CollectionCore {
    pub fn new(name: String) -> Self {
        Self {
            name,
            state: RwLock::new(CollState::default()),
        }
    }

    /// Merges recovered versions into history. Entries may arrive unsorted
    /// and may repeat a `(id, seq)` pair when multiple tables carry the same
    /// version; duplicates collapse.
    pub fn ingest_bootstrap(&self, entries: Vec<BootstrapEntry>) {
        let mut st = self.state.write();
        for entry in entries {
            st.history
                .entry(entry.id_json)
                .or_default()
                .push((entry.seq, entry.value));
        }
        for versions in st.history.values_mut() {
            versions.sort_by_key(|(seq, _)| *seq);
            versions.dedup_by_key(|(seq, _)| *seq);
        }
    }

    /// Validates that the batch's puts keep every unique index consistent,
    /// under the batch's own cumulative effect.
    pub fn validate_batch(&self, ops: &[&BatchOp]) -> Result<()> {
        let st = self.state.read();
        for idx in st.indexes.values() {
            if idx.def.kind != IndexKind::Unique {
                continue;
            }

            // Overlay of key ownership as the batch applies op by op.
            let mut owners: HashMap<String, Option<Vec<u8>>> = HashMap::new();
            // Overlay of each touched id's current unique key.
            let mut id_keys: HashMap<Vec<u8>, Option<String>> = HashMap::new();

            for op in ops {
                let old_key = match id_keys.get(&op.id_json) {
                    Some(overlaid) => overlaid.clone(),
                    None => st
                        .history
                        .get(&op.id_json)
                        .and_then(|versions| versions.last())
                        .and_then(|(_, value)| value.as_deref())
                        .and_then(|bytes| (idx.projector)(bytes).into_iter().next()),
                };

                match &op.value {
                    None => {
                        if let Some(k) = &old_key {
                            owners.insert(k.clone(), None);
                        }
                        id_keys.insert(op.id_json.clone(), None);
                    }
                    Some(bytes) => {
                        let new_key = (idx.projector)(bytes).into_iter().next();
                        if let Some(k) = &new_key {
                            let owner = match owners.get(k) {
                                Some(overlaid) => overlaid.clone(),
                                None => idx.head_owner(k),
                            };
                            if let Some(other) = owner {
                                if other != op.id_json {
                                    return Err(StoreError::UniqueConstraintViolation {
                                        index: idx.def.name.clone(),
                                        key: k.clone(),
                                    });
                                }
                            }
                        }
                        if let Some(ok) = &old_key {
                            if new_key.as_ref() != Some(ok) {
                                owners.insert(ok.clone(), None);
                            }
                        }
                        if let Some(k) = new_key.clone() {
                            owners.insert(k, Some(op.id_json.clone()));
                        }
                        id_keys.insert(op.id_json.clone(), new_key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies one committed op at `seq`: appends the version and records
    /// index edges against the previous head.
    pub fn apply(&self, op: &BatchOp, seq: u64) {
        let mut st = self.state.write();
        let CollState { history, indexes } = &mut *st;

        let versions = history.entry(op.id_json.clone()).or_default();
        let old_value = versions.last().and_then(|(_, value)| value.clone());
        versions.push((seq, op.value.clone()));

        for idx in indexes.values_mut() {
            idx.update(&op.id_json, old_value.as_deref(), op.value.as_deref(), seq);
        }
    }

    /// Registers (or redefines) an index and backfills it from the current
    /// history heads.
    pub fn define_index(&self, def: IndexDef, projector: Projector) {
        let mut st = self.state.write();
        let CollState { history, indexes } = &mut *st;

        let mut idx = IndexState::new(def, projector);
        for (id, versions) in history.iter() {
            if let Some((seq, Some(value))) = versions.last() {
                idx.update(id, None, Some(value.as_slice()), *seq);
            }
        }
        indexes.insert(idx.def.name.clone(), idx);
    }

    /// Drops all history and index state, keeping index definitions and
    /// projectors. Used by restore before re-bootstrapping.
    pub fn reset(&self) {
        let mut st = self.state.write();
        st.history.clear();
        for idx in st.indexes.values_mut() {
            idx.unique.clear();
            idx.multi.clear();
            idx.doc_keys.clear();
        }
    }

    /// Rebuilds every index from the current history heads.
    pub fn rebuild_indexes(&self) {
        let mut st = self.state.write();
        let CollState { history, indexes } = &mut *st;
        for idx in indexes.values_mut() {
            for (id, versions) in history.iter() {
                if let Some((seq, Some(value))) = versions.last() {
                    idx.update(id, None, Some(value.as_slice()), *seq);
                }
            }
        }
    }

    // ---- Read paths ----

    /// Latest visible value of `id` at `snapshot_seq`. Tombstones read as
    /// absent.
    pub fn get_raw(&self, id_json: &[u8], snapshot_seq: u64) -> Option<Vec<u8>> {
        let st = self.state.read();
        visible_doc(&st, id_json, snapshot_seq)
    }

    /// The version list of `id`, truncated to `seq ≤ snapshot_seq`.
    pub fn history_raw(&self, id_json: &[u8], snapshot_seq: u64) -> Vec<(u64, Option<Vec<u8>>)> {
        let st = self.state.read();
        st.history
            .get(id_json)
            .map(|versions| {
                versions
                    .iter()
                    .take_while(|(seq, _)| *seq <= snapshot_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live documents whose encoded id starts with `prefix`, ordered by
    /// encoded id, up to `limit`.
    pub fn scan_raw(
        &self,
        prefix: &[u8],
        limit: usize,
        snapshot_seq: u64,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let st = self.state.read();
        let mut out = Vec::new();
        for (id, versions) in st.history.range(prefix.to_vec()..) {
            if !id.starts_with(prefix) {
                break;
            }
            if let Some((_, Some(value))) = visible(versions, snapshot_seq) {
                out.push((id.clone(), value.clone()));
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    /// Documents holding exactly `key` in the named index at `snapshot_seq`.
    pub fn by_index_raw(
        &self,
        name: &str,
        key: &str,
        snapshot_seq: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let st = self.state.read();
        let idx = st
            .indexes
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("index {:?}", name)))?;

        let mut out = Vec::new();
        match idx.def.kind {
            IndexKind::Unique => {
                if let Some(id) = idx.owner_at(key, snapshot_seq) {
                    if let Some(value) = visible_doc(&st, &id, snapshot_seq) {
                        out.push((id, value));
                    }
                }
            }
            IndexKind::Multi => {
                for id in idx.members_at(key, snapshot_seq) {
                    if let Some(value) = visible_doc(&st, &id, snapshot_seq) {
                        out.push((id, value));
                    }
                }
            }
            IndexKind::Fts | IndexKind::Vector => {
                return Err(StoreError::NotFound(format!(
                    "index {:?} is served by an external search module",
                    name
                )));
            }
        }
        Ok(out)
    }

    /// Documents under index keys starting with `prefix`, ordered by index
    /// key then encoded id, up to `limit`.
    pub fn scan_index_raw(
        &self,
        name: &str,
        prefix: &str,
        limit: usize,
        snapshot_seq: u64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let st = self.state.read();
        let idx = st
            .indexes
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("index {:?}", name)))?;

        let mut out = Vec::new();
        match idx.def.kind {
            IndexKind::Unique => {
                for (key, _) in idx.unique.range(prefix.to_string()..) {
                    if !key.starts_with(prefix) || out.len() >= limit {
                        break;
                    }
                    if let Some(id) = idx.owner_at(key, snapshot_seq) {
                        if let Some(value) = visible_doc(&st, &id, snapshot_seq) {
                            out.push((id, value));
                        }
                    }
                }
            }
            IndexKind::Multi => {
                'keys: for (key, _) in idx.multi.range(prefix.to_string()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    for id in idx.members_at(key, snapshot_seq) {
                        if out.len() >= limit {
                            break 'keys;
                        }
                        if let Some(value) = visible_doc(&st, &id, snapshot_seq) {
                            out.push((id, value));
                        }
                    }
                }
            }
            IndexKind::Fts | IndexKind::Vector => {
                return Err(StoreError::NotFound(format!(
                    "index {:?} is served by an external search module",
                    name
                )));
            }
        }
        Ok(out)
    }

}

/// Latest visible value of an id within an already-taken read guard.
fn visible_doc(st: &CollState, id_json: &[u8], snapshot_seq: u64) -> Option<Vec<u8>> {
    st.history
        .get(id_json)
        .and_then(|versions| visible(versions, snapshot_seq))
        .and_then(|(_, value)| value.clone())
}

pub(crate) fn store_closed() -> StoreError {
    StoreError::Io(std::io::Error::other("store handle dropped"))
}

/// Typed handle over a collection.
///
/// Handles are cheap to clone and hold only a weak reference back to the
/// store; every mutation goes through the store's batch commit.
pub struct Collection<T: Document> {
    pub(crate) core: Arc<CollectionCore>,
    pub(crate) store: Weak<StoreInner>,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T: Document> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Document> Collection<T> {
    fn store(&self) -> Result<Arc<StoreInner>> {
        self.store.upgrade().ok_or_else(store_closed)
    }

    fn snap_seq(&self, snapshot: Option<&Snapshot>) -> u64 {
        snapshot.map_or(u64::MAX, Snapshot::sequence)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Writes `doc` as a single-operation batch. Returns the commit
    /// sequence.
    pub fn put(&self, doc: &T) -> Result<u64> {
        let mut batch = Batch::new();
        batch.put(self, doc)?;
        self.store()?.commit(batch.ops, None)
    }

    /// Tombstones `id` as a single-operation batch. Returns the commit
    /// sequence.
    pub fn delete(&self, id: &T::Id) -> Result<u64> {
        let mut batch = Batch::new();
        batch.delete(self, id)?;
        self.store()?.commit(batch.ops, None)
    }

    /// Reads the latest version of `id`.
    pub fn get(&self, id: &T::Id) -> Result<Option<T>> {
        self.get_at(id, None)
    }

    /// Reads `id` as of `snapshot` (or the latest state when `None`).
    pub fn get_at(&self, id: &T::Id, snapshot: Option<&Snapshot>) -> Result<Option<T>> {
        let id_json = serde_json::to_vec(id)?;
        match self.core.get_raw(&id_json, self.snap_seq(snapshot)) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Scans live documents by encoded-id prefix, ordered by encoded id.
    ///
    /// `limit` defaults to the store's `default_scan_limit`.
    pub fn scan(
        &self,
        prefix: Option<&[u8]>,
        limit: Option<usize>,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<T>> {
        let store = self.store()?;
        let limit = limit.unwrap_or(store.opts.default_scan_limit);
        let rows = self
            .core
            .scan_raw(prefix.unwrap_or(b""), limit, self.snap_seq(snapshot));
        rows.into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }

    /// The version history of `id`, truncated to the snapshot bound.
    pub fn history(
        &self,
        id: &T::Id,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<(u64, Option<T>)>> {
        let id_json = serde_json::to_vec(id)?;
        self.core
            .history_raw(&id_json, self.snap_seq(snapshot))
            .into_iter()
            .map(|(seq, value)| {
                let doc = match value {
                    Some(bytes) => Some(serde_json::from_slice(&bytes)?),
                    None => None,
                };
                Ok((seq, doc))
            })
            .collect()
    }

    /// Defines a unique index projecting at most one key per document, and
    /// persists its definition in the manifest catalog.
    pub fn define_unique_index(
        &self,
        name: &str,
        project: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Result<()> {
        let def = IndexDef {
            name: name.to_string(),
            kind: IndexKind::Unique,
            field: None,
        };
        let projector: Projector = Box::new(move |bytes| {
            serde_json::from_slice::<T>(bytes)
                .ok()
                .and_then(|doc| project(&doc))
                .into_iter()
                .collect()
        });
        self.store()?
            .register_index(&self.core, def, projector, true)
    }

    /// Defines a multi-valued index projecting any number of keys per
    /// document.
    pub fn define_multi_index(
        &self,
        name: &str,
        project: impl Fn(&T) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<()> {
        let def = IndexDef {
            name: name.to_string(),
            kind: IndexKind::Multi,
            field: None,
        };
        let projector: Projector = Box::new(move |bytes| {
            serde_json::from_slice::<T>(bytes)
                .map(|doc| project(&doc))
                .unwrap_or_default()
        });
        self.store()?
            .register_index(&self.core, def, projector, true)
    }

    /// Documents holding exactly `key` in the named index.
    pub fn by_index(
        &self,
        name: &str,
        key: &str,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<T>> {
        let rows = self
            .core
            .by_index_raw(name, key, self.snap_seq(snapshot))?;
        rows.into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }

    /// Documents under index keys starting with `prefix`, ordered by index
    /// key then encoded id.
    pub fn scan_index(
        &self,
        name: &str,
        prefix: &str,
        limit: Option<usize>,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<T>> {
        let store = self.store()?;
        let limit = limit.unwrap_or(store.opts.default_scan_limit);
        let rows = self
            .core
            .scan_index_raw(name, prefix, limit, self.snap_seq(snapshot))?;
        rows.into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }
}
