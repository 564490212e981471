use crate::rooms::RoomRegistry;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::crdt::{RoomKey, RoomType};
use tandem_core::protocol::{ControlMessage, Frame, RawFrame, decode_control};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Room identifier
    pub room: String,
    /// Room structure: map, sequence or rich_text (default: map)
    #[serde(rename = "type")]
    pub room_type: Option<String>,
    /// Participant the connection speaks for
    pub participant: Option<String>,
}

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<RoomRegistry>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if query.room.trim().is_empty() {
        warn!("WebSocket connection rejected: empty room id");
        return (StatusCode::BAD_REQUEST, "room must not be empty").into_response();
    }

    let room_type = match query.room_type.as_deref() {
        None => RoomType::Map,
        Some(raw) => match raw.parse::<RoomType>() {
            Ok(t) => t,
            Err(e) => {
                warn!("WebSocket connection rejected: {}", e);
                return (StatusCode::BAD_REQUEST, e).into_response();
            }
        },
    };

    let key = RoomKey::new(query.room, room_type);
    let participant = query.participant.filter(|p| !p.is_empty());
    info!("WebSocket upgrade: room={}, participant={:?}", key, participant);

    ws.on_upgrade(move |socket| handle_socket(socket, state, key, participant))
        .into_response()
}

fn to_message(frame: RawFrame) -> Message {
    match frame {
        RawFrame::Binary(bytes) => Message::Binary(bytes.into()),
        RawFrame::Text(text) => Message::Text(text.into()),
    }
}

/// Handle an established WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: WsState,
    key: RoomKey,
    participant: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let conn = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RawFrame>();

    let room = match state
        .registry
        .attach(&key, conn, participant.clone(), outbound_tx)
        .await
    {
        Ok(room) => room,
        Err(e) => {
            error!("Failed to attach {} to {}: {}", conn, key, e);
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    info!("WebSocket connected: conn={}, room={}", conn, key);

    let (ping, pong) = match (Frame::Ping.encode(), Frame::Pong.encode()) {
        (Ok(ping), Ok(pong)) => (ping, pong),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to encode heartbeat frames: {}", e);
            let _ = room.detach(conn).await;
            return;
        }
    };

    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    // Handle bidirectional communication
    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Binary(data)) => {
                        last_seen = Instant::now();
                        if room.delta(conn, data.to_vec()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        last_seen = Instant::now();
                        match decode_control(text.as_str()) {
                            Ok(ControlMessage::Awareness { participant_id, state }) => {
                                if room.awareness(conn, participant_id, state).is_err() {
                                    break;
                                }
                            }
                            Ok(ControlMessage::Ping) => {
                                if let Err(e) = ws_tx.send(to_message(pong.clone())).await {
                                    error!("Failed to send pong: {}", e);
                                    break;
                                }
                            }
                            Ok(ControlMessage::Pong) => {}
                            Ok(ControlMessage::Presence { .. }) | Ok(ControlMessage::Unknown) => {
                                debug!("Ignoring control message from {}", conn);
                            }
                            Err(e) => warn!("Dropping frame from {}: {}", conn, e),
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        last_seen = Instant::now();
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_seen = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        break;
                    }
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }

            // Frames queued by the room for this connection
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = ws_tx.send(to_message(frame)).await {
                    error!("Failed to send frame: {}", e);
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= state.heartbeat_timeout {
                    warn!("Connection {} silent for {:?}, dropping", conn, state.heartbeat_timeout);
                    break;
                }
                if let Err(e) = ws_tx.send(to_message(ping.clone())).await {
                    error!("Failed to send ping: {}", e);
                    break;
                }
            }
        }
    }

    info!("WebSocket disconnected: conn={}, room={}", conn, key);

    match room.detach(conn).await {
        Ok(0) => state.registry.schedule_eviction(key),
        Ok(_) => {}
        Err(e) => debug!("Room {} already stopped: {}", key, e),
    }
}
