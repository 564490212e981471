use crate::rooms::{RoomRegistry, ServerStats};
use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<RoomRegistry>,
}

/// Server status response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .with_state(state)
}

/// GET /api/status - Get server status
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;

    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
    })
}

/// GET /api/stats - Per-room statistics
async fn get_stats(State(state): State<ApiState>) -> Json<ServerStats> {
    Json(state.registry.stats().await)
}
