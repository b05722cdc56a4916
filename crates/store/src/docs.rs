//! The untyped "document" collection.
//!
//! Values are arbitrary JSON trees; indexes are defined dynamically by JSON
//! key path (`.field`, `.a.b`, `.arr[]`). Because these definitions are
//! self-contained — name, kind, path — they are rebuilt automatically from
//! the manifest catalog after restart, unlike typed indexes whose projector
//! closures must be re-declared by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::{Batch, Collection, Document};
use crate::error::Result;
use crate::index::{IndexDef, IndexKind, Projector};
use crate::keypath::KeyPath;
use crate::snapshot::Snapshot;

/// The stored form of an untyped document: its id plus the JSON tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonDoc {
    pub id: Value,
    pub value: Value,
}

impl Document for JsonDoc {
    type Id = Value;

    fn id(&self) -> Value {
        self.id.clone()
    }
}

/// Handle over an untyped document collection.
#[derive(Clone)]
pub struct DocCollection {
    pub(crate) inner: Collection<JsonDoc>,
}

impl DocCollection {
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Writes a document. Returns the commit sequence.
    pub fn put(&self, id: Value, value: Value) -> Result<u64> {
        self.inner.put(&JsonDoc { id, value })
    }

    /// Tombstones a document. Returns the commit sequence.
    pub fn delete(&self, id: &Value) -> Result<u64> {
        self.inner.delete(id)
    }

    /// Reads the latest version of `id`, or a snapshot-bound version.
    pub fn get(&self, id: &Value, snapshot: Option<&Snapshot>) -> Result<Option<Value>> {
        Ok(self.inner.get_at(id, snapshot)?.map(|doc| doc.value))
    }

    /// Scans live documents ordered by encoded id.
    pub fn scan(
        &self,
        prefix: Option<&[u8]>,
        limit: Option<usize>,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<(Value, Value)>> {
        let docs = self.inner.scan(prefix, limit, snapshot)?;
        Ok(docs.into_iter().map(|d| (d.id, d.value)).collect())
    }

    /// Version history of `id`.
    pub fn history(
        &self,
        id: &Value,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<(u64, Option<Value>)>> {
        let versions = self.inner.history(id, snapshot)?;
        Ok(versions
            .into_iter()
            .map(|(seq, doc)| (seq, doc.map(|d| d.value)))
            .collect())
    }

    /// Defines an index over a JSON key path and persists it in the manifest
    /// catalog, from which it is rebuilt on restart.
    pub fn define_index(&self, name: &str, kind: IndexKind, key_path: &str) -> Result<()> {
        let path = KeyPath::parse(key_path)?;
        let def = IndexDef {
            name: name.to_string(),
            kind,
            field: Some(key_path.to_string()),
        };
        let store = self
            .inner
            .store
            .upgrade()
            .ok_or_else(crate::collection::store_closed)?;
        store.register_index(&self.inner.core, def.clone(), keypath_projector(&def, path), true)
    }

    /// Documents holding exactly `key` in the named index.
    pub fn by_index(
        &self,
        name: &str,
        key: &str,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<(Value, Value)>> {
        let docs = self.inner.by_index(name, key, snapshot)?;
        Ok(docs.into_iter().map(|d| (d.id, d.value)).collect())
    }

    /// Documents under index keys starting with `prefix`.
    pub fn scan_index(
        &self,
        name: &str,
        prefix: &str,
        limit: Option<usize>,
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<(Value, Value)>> {
        let docs = self.inner.scan_index(name, prefix, limit, snapshot)?;
        Ok(docs.into_iter().map(|d| (d.id, d.value)).collect())
    }

    /// Stages a put into a multi-collection batch.
    pub fn batch_put(&self, batch: &mut Batch, id: Value, value: Value) -> Result<()> {
        batch.put(&self.inner, &JsonDoc { id, value })
    }

    /// Stages a delete into a multi-collection batch.
    pub fn batch_delete(&self, batch: &mut Batch, id: &Value) -> Result<()> {
        batch.delete(&self.inner, id)
    }
}

/// Builds the projector for a key-path index over [`JsonDoc`] values.
///
/// Unique projectors truncate to the first extracted key; the fts/vector
/// kinds carry no keys at the core contract level.
pub(crate) fn keypath_projector(def: &IndexDef, path: KeyPath) -> Projector {
    let kind = def.kind;
    Box::new(move |bytes| {
        let Ok(doc) = serde_json::from_slice::<JsonDoc>(bytes) else {
            return Vec::new();
        };
        let mut extracted = path.extract(&doc.value);
        match kind {
            IndexKind::Unique => {
                extracted.truncate(1);
                extracted
            }
            IndexKind::Multi => extracted,
            IndexKind::Fts | IndexKind::Vector => Vec::new(),
        }
    })
}
