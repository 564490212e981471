//! Room coordination: one actor per room, created on demand.

mod coordinator;
mod persist;
mod registry;

pub use coordinator::{
    ConnectionId, Outbound, RoomCoordinator, RoomHandle, RoomSettings, RoomStats,
};
pub use persist::{PersistSettings, Persister};
pub use registry::{RoomRegistry, ServerStats};
