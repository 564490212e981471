//! Replicated documents and snapshot storage.
//!
//! A room's content lives in a [`ReplicatedDoc`], a yrs document whose root
//! container matches the room's [`RoomType`]. Documents are persisted as a
//! single compacted snapshot through a [`SnapshotStore`].

mod memory_storage;
mod replicated_doc;
#[cfg(all(not(target_arch = "wasm32"), feature = "crdt-sqlite"))]
mod sqlite_storage;
mod storage;
mod types;

pub use memory_storage::MemoryStorage;
pub use replicated_doc::{ReplicatedDoc, SubscriptionId};
#[cfg(all(not(target_arch = "wasm32"), feature = "crdt-sqlite"))]
pub use sqlite_storage::SqliteStorage;
pub use storage::{SnapshotStore, StorageResult};
pub use types::{
    DocEvent, RichTextSpan, RoomKey, RoomType, TextAttributes, UpdateOrigin, any_to_json,
    json_to_any,
};
