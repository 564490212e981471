//! Per-room actor owning the authoritative document.
//!
//! Each [`RoomCoordinator`] runs as its own tokio task and handles its
//! commands strictly in arrival order. The document and the presence
//! registry are only ever touched from that task, so no locking is needed
//! for them. Everything else talks to the room through a [`RoomHandle`].

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tandem_core::crdt::{ReplicatedDoc, RoomKey, RoomType, SnapshotStore, UpdateOrigin};
use tandem_core::error::TandemError;
use tandem_core::presence::{AwarenessState, PresenceRegistry};
use tandem_core::protocol::{Frame, RawFrame};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::persist::{PersistSettings, Persister};

/// Identifies one WebSocket connection.
pub type ConnectionId = Uuid;

/// Frames queued for delivery to one connection.
pub type Outbound = mpsc::UnboundedSender<RawFrame>;

#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Delay between a merged delta and the snapshot write
    pub persist_debounce: Duration,
    pub persist: PersistSettings,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_millis(500),
            persist: PersistSettings::default(),
        }
    }
}

/// Point-in-time description of a room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: String,
    pub room_type: RoomType,
    pub connections: usize,
    pub participants: usize,
    pub snapshot_bytes: usize,
    pub created_at: DateTime<Utc>,
}

enum RoomCommand {
    Attach {
        conn: ConnectionId,
        participant: Option<String>,
        outbound: Outbound,
        reply: oneshot::Sender<()>,
    },
    Detach {
        conn: ConnectionId,
        reply: oneshot::Sender<usize>,
    },
    Delta {
        conn: ConnectionId,
        bytes: Vec<u8>,
    },
    Awareness {
        conn: ConnectionId,
        participant_id: String,
        state: AwarenessState,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
    TryEvict {
        reply: oneshot::Sender<bool>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), TandemError>>,
    },
}

/// Cloneable address of a running room coordinator.
#[derive(Clone)]
pub struct RoomHandle {
    key: RoomKey,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Whether the coordinator task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles address the same coordinator task.
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    fn closed(&self) -> TandemError {
        TandemError::RoomClosed(self.key.to_string())
    }

    fn send(&self, command: RoomCommand) -> Result<(), TandemError> {
        self.tx.send(command).map_err(|_| self.closed())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, TandemError> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply))?;
        response.await.map_err(|_| self.closed())
    }

    /// Attach a connection. Resolves once the snapshot and the presence
    /// snapshot have been queued on `outbound`.
    pub async fn attach(
        &self,
        conn: ConnectionId,
        participant: Option<String>,
        outbound: Outbound,
    ) -> Result<(), TandemError> {
        self.request(|reply| RoomCommand::Attach {
            conn,
            participant,
            outbound,
            reply,
        })
        .await
    }

    /// Detach a connection. Returns the number of connections left.
    pub async fn detach(&self, conn: ConnectionId) -> Result<usize, TandemError> {
        self.request(|reply| RoomCommand::Detach { conn, reply }).await
    }

    pub fn delta(&self, conn: ConnectionId, bytes: Vec<u8>) -> Result<(), TandemError> {
        self.send(RoomCommand::Delta { conn, bytes })
    }

    pub fn awareness(
        &self,
        conn: ConnectionId,
        participant_id: String,
        state: AwarenessState,
    ) -> Result<(), TandemError> {
        self.send(RoomCommand::Awareness {
            conn,
            participant_id,
            state,
        })
    }

    pub async fn stats(&self) -> Result<RoomStats, TandemError> {
        self.request(|reply| RoomCommand::Stats { reply }).await
    }

    /// Ask the coordinator to shut down if it has no connections. It
    /// agrees only after a successful final flush.
    pub async fn try_evict(&self) -> Result<bool, TandemError> {
        self.request(|reply| RoomCommand::TryEvict { reply }).await
    }

    /// Write the current snapshot and wait for it to land.
    pub async fn flush(&self) -> Result<(), TandemError> {
        self.request(|reply| RoomCommand::Flush { reply }).await?
    }
}

struct Client {
    participant: Option<String>,
    outbound: Outbound,
}

pub struct RoomCoordinator {
    key: RoomKey,
    doc: ReplicatedDoc,
    presence: PresenceRegistry,
    clients: IndexMap<ConnectionId, Client>,
    persister: Persister,
    settings: RoomSettings,
    /// When the pending snapshot write is due
    persist_at: Option<Instant>,
    created_at: DateTime<Utc>,
}

impl RoomCoordinator {
    /// Start a coordinator for `doc` and return its handle.
    pub fn spawn(
        key: RoomKey,
        doc: ReplicatedDoc,
        storage: Arc<dyn SnapshotStore>,
        settings: RoomSettings,
    ) -> RoomHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let persister = Persister::spawn(storage, key.storage_key(), settings.persist.clone());
        let coordinator = RoomCoordinator {
            key: key.clone(),
            doc,
            presence: PresenceRegistry::new(),
            clients: IndexMap::new(),
            persister,
            settings,
            persist_at: None,
            created_at: Utc::now(),
        };
        tokio::spawn(coordinator.run(rx));
        RoomHandle { key, tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        debug!("Room {} started", self.key);
        loop {
            let persist_at = self.persist_at;
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(persist_at.unwrap_or_else(Instant::now)), if persist_at.is_some() => {
                    self.persist_now();
                }
            }
        }
        if self.persist_at.is_some() {
            self.persist_now();
        }
        info!("Room {} stopped", self.key);
    }

    async fn handle(&mut self, command: RoomCommand) -> ControlFlow<()> {
        match command {
            RoomCommand::Attach {
                conn,
                participant,
                outbound,
                reply,
            } => {
                self.attach(conn, participant, outbound);
                let _ = reply.send(());
            }
            RoomCommand::Detach { conn, reply } => {
                self.detach(conn);
                let _ = reply.send(self.clients.len());
            }
            RoomCommand::Delta { conn, bytes } => self.merge(conn, bytes),
            RoomCommand::Awareness {
                conn,
                participant_id,
                state,
            } => self.update_awareness(conn, participant_id, state),
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            RoomCommand::TryEvict { reply } => {
                if !self.clients.is_empty() {
                    let _ = reply.send(false);
                    return ControlFlow::Continue(());
                }
                match self.flush().await {
                    Ok(()) => {
                        let _ = reply.send(true);
                        return ControlFlow::Break(());
                    }
                    Err(e) => {
                        error!("Keeping room {} alive, final flush failed: {}", self.key, e);
                        let _ = reply.send(false);
                    }
                }
            }
            RoomCommand::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
        }
        ControlFlow::Continue(())
    }

    fn attach(&mut self, conn: ConnectionId, participant: Option<String>, outbound: Outbound) {
        // New joiners get the full state and presence; nobody else is told
        let snapshot = RawFrame::Binary(self.doc.encode_state_as_update());
        if outbound.send(snapshot).is_err() {
            warn!("Connection {} closed before the snapshot was sent", conn);
            return;
        }
        if let Some(frame) = self.presence_frame() {
            let _ = outbound.send(frame);
        }
        self.clients.insert(
            conn,
            Client {
                participant,
                outbound,
            },
        );
        info!(
            "Attached {} to room {} ({} connections)",
            conn,
            self.key,
            self.clients.len()
        );
    }

    fn detach(&mut self, conn: ConnectionId) {
        let Some(client) = self.clients.shift_remove(&conn) else {
            return;
        };
        info!(
            "Detached {} from room {} ({} connections)",
            conn,
            self.key,
            self.clients.len()
        );

        if let Some(participant) = client.participant {
            let still_present = self
                .clients
                .values()
                .any(|c| c.participant.as_deref() == Some(participant.as_str()));
            if !still_present && self.presence.remove(&participant).is_some() {
                self.broadcast_presence();
            }
        }

        if self.clients.is_empty() && self.persist_at.is_some() {
            self.persist_now();
        }
    }

    fn merge(&mut self, conn: ConnectionId, bytes: Vec<u8>) {
        if let Err(e) = self.doc.apply_update(&bytes, UpdateOrigin::Remote) {
            warn!("Dropping malformed delta from {} in {}: {}", conn, self.key, e);
            return;
        }

        let frame = RawFrame::Binary(bytes);
        for (id, client) in &self.clients {
            if *id != conn {
                let _ = client.outbound.send(frame.clone());
            }
        }

        if self.persist_at.is_none() {
            self.persist_at = Some(Instant::now() + self.settings.persist_debounce);
        }
    }

    fn update_awareness(&mut self, conn: ConnectionId, participant_id: String, state: AwarenessState) {
        let Some(client) = self.clients.get_mut(&conn) else {
            return;
        };
        // A connection speaks for one participant only
        let participant = client.participant.get_or_insert(participant_id).clone();
        if state.participant_id != participant {
            debug!(
                "Connection {} sent awareness for {}, recording it as {}",
                conn, state.participant_id, participant
            );
        }
        self.presence.upsert(&participant, state);
        self.broadcast_presence();
    }

    fn presence_frame(&self) -> Option<RawFrame> {
        match Frame::Presence(self.presence.snapshot()).encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!("Failed to encode presence for {}: {}", self.key, e);
                None
            }
        }
    }

    fn broadcast_presence(&self) {
        let Some(frame) = self.presence_frame() else {
            return;
        };
        for client in self.clients.values() {
            let _ = client.outbound.send(frame.clone());
        }
    }

    fn persist_now(&mut self) {
        self.persist_at = None;
        self.persister.store(self.doc.encode_state_as_update());
    }

    async fn flush(&mut self) -> Result<(), TandemError> {
        self.persist_at = None;
        self.persister
            .flush(self.doc.encode_state_as_update())
            .await
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            room_id: self.key.room_id.clone(),
            room_type: self.key.room_type,
            connections: self.clients.len(),
            participants: self.presence.len(),
            snapshot_bytes: self.doc.encode_state_as_update().len(),
            created_at: self.created_at,
        }
    }
}
