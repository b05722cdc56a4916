use crate::{Document, Store, StoreOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub tags: Vec<String>,
}

impl Document for User {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }
}

pub fn user(id: &str, email: &str, tags: &[&str]) -> User {
    User {
        id: id.to_string(),
        email: email.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

/// Options sized for tests: tiny cache, rotation off unless a test asks.
pub fn opts(path: &Path) -> StoreOptions {
    let mut opts = StoreOptions::new(path);
    opts.cache_bytes = 1024 * 1024;
    opts.wal_segment_bytes = 0;
    opts
}

pub fn open(path: &Path) -> Store {
    Store::open(opts(path)).expect("open store")
}

pub fn count_sst_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext == "sst")
                .unwrap_or(false)
        })
        .count()
}
