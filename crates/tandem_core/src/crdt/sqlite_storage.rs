//! SQLite-backed storage implementation for snapshot persistence.
//!
//! This module provides a persistent storage backend using SQLite. Each
//! room owns exactly one row holding its compacted document state.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{SnapshotStore, StorageResult};

/// SQLite-backed snapshot storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            -- One compacted snapshot per room
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Last write time of a snapshot in milliseconds since the epoch.
    pub fn updated_at(&self, name: &str) -> StorageResult<Option<i64>> {
        let conn = self.conn();
        let ts = conn
            .query_row(
                "SELECT updated_at FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts)
    }
}

impl SnapshotStore for SqliteStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn();
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let conn = self.conn();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at) VALUES (?, ?, ?)",
            params![name, state, now],
        )?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name FROM documents ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{ReplicatedDoc, RoomType, UpdateOrigin};

    #[test]
    fn test_save_and_load_doc() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_doc("map:doc", &[1, 2, 3]).unwrap();
        assert_eq!(storage.load_doc("map:doc").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.load_doc("map:other").unwrap(), None);
        assert!(storage.updated_at("map:doc").unwrap().is_some());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.db");

        let doc = ReplicatedDoc::new(RoomType::Map);
        doc.map_set("title", serde_json::json!("Hello")).unwrap();
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .save_doc("map:doc", &doc.encode_state_as_update())
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        let state = storage.load_doc("map:doc").unwrap().unwrap();
        let restored = ReplicatedDoc::new(RoomType::Map);
        restored.apply_update(&state, UpdateOrigin::Snapshot).unwrap();
        assert_eq!(restored.to_json(), doc.to_json());
    }

    #[test]
    fn test_list_and_delete_docs() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_doc("sequence:b", &[1]).unwrap();
        storage.save_doc("map:a", &[1]).unwrap();
        storage.save_doc("map:a", &[2]).unwrap();
        assert_eq!(storage.list_docs().unwrap(), vec!["map:a", "sequence:b"]);

        storage.delete_doc("map:a").unwrap();
        assert_eq!(storage.list_docs().unwrap(), vec!["sequence:b"]);
    }
}
