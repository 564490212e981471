#![doc = include_str!("../README.md")]

//! Tandem Sync Server
//!
//! Hosts rooms of replicated documents. Each room is coordinated by a
//! single task that merges deltas, relays them to the other connections,
//! tracks presence and persists snapshots.
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATA_DIR`: Directory for the snapshot database (default: ./tandem_data)
//! - `STORAGE`: `sqlite` or `memory` (default: sqlite)
//! - `PERSIST_DEBOUNCE_MS`: Delay before a merged delta is persisted (default: 500)
//! - `PERSIST_RETRY_BASE_MS`: Base delay of the snapshot write backoff (default: 250)
//! - `PERSIST_MAX_FLUSH_ATTEMPTS`: Attempts for a final flush (default: 5)
//! - `ROOM_IDLE_TIMEOUT_SECS`: Grace period before an empty room is evicted (default: 30)
//! - `HEARTBEAT_INTERVAL_SECS`: Server ping cadence (default: 15)
//! - `HEARTBEAT_TIMEOUT_SECS`: Silence before a connection is dropped (default: 45)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins, or `*`

pub mod config;
pub mod handlers;
pub mod rooms;

pub use config::{Config, StorageKind};

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::get,
};
use std::sync::Arc;
use tandem_core::crdt::{MemoryStorage, SnapshotStore, SqliteStorage};
use tandem_core::error::TandemError;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::handlers::{api::ApiState, api_routes, ws::WsState, ws_handler};
use crate::rooms::RoomRegistry;

/// Open the snapshot store selected by the configuration.
pub fn open_storage(config: &Config) -> Result<Arc<dyn SnapshotStore>, TandemError> {
    match config.storage {
        StorageKind::Sqlite => {
            std::fs::create_dir_all(&config.data_dir)?;
            Ok(Arc::new(SqliteStorage::open(config.database_path())?))
        }
        StorageKind::Memory => Ok(Arc::new(MemoryStorage::new())),
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin {:?}", origin);
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(allow_origin)
}

/// Build the HTTP router serving the sync endpoint and the status API.
pub fn build_router(registry: Arc<RoomRegistry>, config: &Config) -> Router {
    let ws_state = WsState {
        registry: registry.clone(),
        heartbeat_interval: config.heartbeat_interval,
        heartbeat_timeout: config.heartbeat_timeout,
    };
    let api_state = ApiState { registry };

    Router::new()
        // Health check
        .route("/", get(|| async { "Tandem Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket sync endpoint
        .route("/sync", get(ws_handler).with_state(ws_state))
        // API routes
        .nest("/api", api_routes(api_state))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}
