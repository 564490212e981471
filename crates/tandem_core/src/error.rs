use thiserror::Error;

/// Unified error type for tandem operations
#[derive(Debug, Error)]
pub enum TandemError {
    // Wire errors
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },

    // Document errors
    #[error("Invalid document operation: {0}")]
    InvalidOperation(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(all(not(target_arch = "wasm32"), feature = "crdt-sqlite"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // Room errors
    #[error("Room '{0}' is closed")]
    RoomClosed(String),
}

impl TandemError {
    /// Whether this error only affects a single frame, leaving the
    /// connection and the document intact.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, TandemError::Decode(_) | TandemError::Json(_))
    }
}

/// Result type alias for tandem operations
pub type Result<T> = std::result::Result<T, TandemError>;
