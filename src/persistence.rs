//! Durable storage for a node's linkage result.
//!
//! A node stores the partner slice it received, verbatim, under a fixed tag.
//! [`FileResultStore`] writes one JSON file per tag; [`InMemoryResultStore`]
//! keeps results for tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::types::PartnerSlice;

/// Tag every node stores its result under.
pub const RESULT_TAG: &str = "record-linkage-results";

/// Sink for a node's result slice.
pub trait ResultStore: Send + Sync {
    fn save(&self, tag: &str, slice: &PartnerSlice) -> Result<(), StoreError>;
}

/// File-based store: `<dir>/<tag>.json`. Save overwrites.
#[derive(Clone, Debug)]
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{tag}.json"))
    }

    /// Load a stored slice. Returns None if nothing was stored under `tag`.
    pub fn load(&self, tag: &str) -> Result<Option<PartnerSlice>, StoreError> {
        let data = match std::fs::read_to_string(self.path_for(tag)) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }
}

impl ResultStore for FileResultStore {
    fn save(&self, tag: &str, slice: &PartnerSlice) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(slice)?;
        std::fs::write(self.path_for(tag), json)?;
        Ok(())
    }
}

/// In-memory store. Clone shares the same backing map.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResultStore {
    saved: Arc<Mutex<BTreeMap<String, PartnerSlice>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<PartnerSlice> {
        self.saved.lock().ok().and_then(|m| m.get(tag).cloned())
    }
}

impl ResultStore for InMemoryResultStore {
    fn save(&self, tag: &str, slice: &PartnerSlice) -> Result<(), StoreError> {
        if let Ok(mut saved) = self.saved.lock() {
            saved.insert(tag.to_string(), slice.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use std::collections::BTreeSet;

    fn slice() -> PartnerSlice {
        let mut slice = PartnerSlice::new();
        slice.insert(NodeId::new("B"), BTreeSet::from([0, 4]));
        slice.insert(NodeId::new("C"), BTreeSet::new());
        slice
    }

    #[test]
    fn file_store_round_trips_slice() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::new(dir.path().join("node-a"));
        assert!(store.load(RESULT_TAG).unwrap().is_none());
        store.save(RESULT_TAG, &slice()).unwrap();
        assert_eq!(store.load(RESULT_TAG).unwrap(), Some(slice()));
        let raw = std::fs::read_to_string(store.path_for(RESULT_TAG)).unwrap();
        assert!(raw.contains("\"B\""));
    }

    #[test]
    fn in_memory_store_shares_backing_map() {
        let store = InMemoryResultStore::new();
        let view = store.clone();
        store.save(RESULT_TAG, &slice()).unwrap();
        assert_eq!(view.get(RESULT_TAG), Some(slice()));
        assert!(view.get("other").is_none());
    }
}
