//! Secondary-index definitions and versioned index state.
//!
//! Index maps record a version edge per mutation, so a snapshot read can
//! resolve the index as of any sequence:
//!
//! - unique: `key → [(seq, owner id | ⊥)]` — at most one live owner per key
//!   at any sequence.
//! - multi: `key → [(seq, id set)]` — the full membership set is recorded at
//!   each edge.
//!
//! Version lists are sorted vectors; binary search by sequence resolves a
//! snapshot bound.
//!
//! The `fts` and `vector` kinds belong to the external search modules. The
//! core persists their definitions in the manifest catalog and maintains
//! only the `doc-id-key → id` mapping those modules consume.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The four index kinds of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Unique,
    Multi,
    Fts,
    Vector,
}

/// A persisted index definition.
///
/// `field` is the JSON key path for dynamically-defined (document) indexes;
/// typed indexes use projector closures instead and leave it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub kind: IndexKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Extracts index keys from an encoded document.
///
/// Unique projectors yield zero or one key; multi projectors yield any
/// number. A document that fails to decode yields no keys.
pub(crate) type Projector = Box<dyn Fn(&[u8]) -> Vec<String> + Send + Sync>;

/// In-memory state of one index on one collection.
pub(crate) struct IndexState {
    pub def: IndexDef,
    pub projector: Projector,
    /// unique: key → version edges of the owning id.
    pub unique: BTreeMap<String, Vec<(u64, Option<Vec<u8>>)>>,
    /// multi: key → version edges of the member id set.
    pub multi: BTreeMap<String, Vec<(u64, BTreeSet<Vec<u8>>)>>,
    /// fts/vector contract: doc-id-key → encoded id.
    pub doc_keys: BTreeMap<String, Vec<u8>>,
}

impl IndexState {
    pub fn new(def: IndexDef, projector: Projector) -> Self {
        Self {
            def,
            projector,
            unique: BTreeMap::new(),
            multi: BTreeMap::new(),
            doc_keys: BTreeMap::new(),
        }
    }

    /// Records the version edges for one mutation of `id` at `seq`.
    ///
    /// `old` is the document value the mutation replaces (if any), `new` the
    /// value being written (`None` = delete).
    pub fn update(&mut self, id: &[u8], old: Option<&[u8]>, new: Option<&[u8]>, seq: u64) {
        let old_keys = old.map(|b| (self.projector)(b)).unwrap_or_default();
        let new_keys = new.map(|b| (self.projector)(b)).unwrap_or_default();

        match self.def.kind {
            IndexKind::Unique => {
                let old_key = old_keys.first();
                let new_key = new_keys.first();
                if old_key != new_key {
                    if let Some(k) = old_key {
                        self.unique.entry(k.clone()).or_default().push((seq, None));
                    }
                    if let Some(k) = new_key {
                        self.unique
                            .entry(k.clone())
                            .or_default()
                            .push((seq, Some(id.to_vec())));
                    }
                }
            }
            IndexKind::Multi => {
                let old_set: BTreeSet<&String> = old_keys.iter().collect();
                let new_set: BTreeSet<&String> = new_keys.iter().collect();

                for key in old_set.difference(&new_set) {
                    let versions = self.multi.entry((*key).clone()).or_default();
                    let mut members = versions.last().map(|(_, s)| s.clone()).unwrap_or_default();
                    members.remove(id);
                    versions.push((seq, members));
                }
                for key in new_set.difference(&old_set) {
                    let versions = self.multi.entry((*key).clone()).or_default();
                    let mut members = versions.last().map(|(_, s)| s.clone()).unwrap_or_default();
                    members.insert(id.to_vec());
                    versions.push((seq, members));
                }
            }
            IndexKind::Fts | IndexKind::Vector => {
                let id_key = String::from_utf8_lossy(id).into_owned();
                if new.is_some() {
                    self.doc_keys.insert(id_key, id.to_vec());
                } else {
                    self.doc_keys.remove(&id_key);
                }
            }
        }
    }

    /// Current owner of a unique key (the head of its version list).
    pub fn head_owner(&self, key: &str) -> Option<Vec<u8>> {
        self.unique
            .get(key)
            .and_then(|versions| versions.last())
            .and_then(|(_, owner)| owner.clone())
    }

    /// Owner of a unique key as of `snapshot_seq`.
    pub fn owner_at(&self, key: &str, snapshot_seq: u64) -> Option<Vec<u8>> {
        let versions = self.unique.get(key)?;
        visible(versions, snapshot_seq)?.1.clone()
    }

    /// Members of a multi key as of `snapshot_seq`.
    pub fn members_at(&self, key: &str, snapshot_seq: u64) -> BTreeSet<Vec<u8>> {
        self.multi
            .get(key)
            .and_then(|versions| visible(versions, snapshot_seq))
            .map(|(_, members)| members.clone())
            .unwrap_or_default()
    }
}

/// Latest version with `seq ≤ snapshot_seq` in a sequence-sorted list.
pub(crate) fn visible<V>(versions: &[(u64, V)], snapshot_seq: u64) -> Option<&(u64, V)> {
    let idx = versions.partition_point(|(seq, _)| *seq <= snapshot_seq);
    idx.checked_sub(1).map(|i| &versions[i])
}
