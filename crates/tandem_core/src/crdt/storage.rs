//! Storage abstraction for snapshot persistence.
//!
//! This module defines the [`SnapshotStore`] trait which abstracts over
//! different storage backends (SQLite, in-memory) for persisting one
//! compacted document snapshot per room.

use crate::error::TandemError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, TandemError>;

/// Trait for snapshot storage backends.
///
/// # Storage Model
///
/// One durable blob per document name, holding the full encoded state.
/// Writes overwrite, so saving the same snapshot twice is harmless and a
/// retried write never duplicates content.
///
/// Implementations may block; async callers should run them on a
/// blocking-capable thread.
pub trait SnapshotStore: Send + Sync {
    /// Load the full document state as a binary blob.
    ///
    /// Returns `None` if the document doesn't exist.
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the full document state, overwriting any existing state.
    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Delete a document snapshot.
    fn delete_doc(&self, name: &str) -> StorageResult<()>;

    /// List all document names in storage.
    fn list_docs(&self) -> StorageResult<Vec<String>>;
}
