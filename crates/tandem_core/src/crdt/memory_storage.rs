//! In-memory storage implementation for testing.
//!
//! This provides a simple in-memory implementation of [`SnapshotStore`]
//! for use in unit tests, development, and ephemeral servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::storage::{SnapshotStore, StorageResult};
use crate::error::TandemError;

/// In-memory snapshot storage.
///
/// Thread-safe via `RwLock` but data is lost when dropped. Writes can be
/// made to fail on demand to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: Arc<RwLock<HashMap<String, Vec<u8>>>>,

    /// Number of upcoming `save_doc` calls that should fail
    failing_saves: AtomicUsize,

    /// Number of successful `save_doc` calls
    saves: AtomicUsize,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `save_doc` fail.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for MemoryStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let should_fail = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TandemError::Persistence(format!(
                "injected write failure for {}",
                name
            )));
        }

        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(name.to_string(), state.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.remove(name);
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = docs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let storage = MemoryStorage::new();
        storage.save_doc("map:doc-1", &[1, 2, 3]).unwrap();
        assert_eq!(storage.load_doc("map:doc-1").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.load_doc("missing").unwrap(), None);
    }

    #[test]
    fn test_save_overwrites() {
        let storage = MemoryStorage::new();
        storage.save_doc("doc", &[1]).unwrap();
        storage.save_doc("doc", &[2]).unwrap();
        assert_eq!(storage.load_doc("doc").unwrap(), Some(vec![2]));
        assert_eq!(storage.save_count(), 2);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let storage = MemoryStorage::new();
        storage.fail_next_saves(2);
        assert!(storage.save_doc("doc", &[1]).is_err());
        assert!(storage.save_doc("doc", &[1]).is_err());
        assert!(storage.save_doc("doc", &[1]).is_ok());
        assert_eq!(storage.save_count(), 1);
    }

    #[test]
    fn test_list_and_delete() {
        let storage = MemoryStorage::new();
        storage.save_doc("b", &[1]).unwrap();
        storage.save_doc("a", &[1]).unwrap();
        assert_eq!(storage.list_docs().unwrap(), vec!["a", "b"]);
        storage.delete_doc("a").unwrap();
        assert_eq!(storage.list_docs().unwrap(), vec!["b"]);
    }
}
