#![doc = include_str!("../README.md")]

/// Error (common error types)
pub mod error;

/// Replicated documents and snapshot storage
pub mod crdt;

/// Wire codec (binary deltas and JSON control frames)
pub mod protocol;

/// Ephemeral presence (awareness)
pub mod presence;

/// Reconnection backoff state machine
pub mod reconnect;

/// Client sync session
pub mod session;

pub use crdt::{ReplicatedDoc, RoomKey, RoomType, UpdateOrigin};
pub use error::{Result, TandemError};
pub use presence::{AwarenessPatch, AwarenessState, PresenceRegistry};
pub use protocol::{ControlMessage, Frame, RawFrame};
pub use session::{ConnectionState, SessionConfig, SessionError, SyncSession};
