//! Client sync session.
//!
//! [`SyncSession`] is the per-document, per-participant coordination point
//! on the client. It owns no socket and no timer: a driver feeds it
//! transport events (`on_open`, `on_frame`, `on_closed`) and clock ticks,
//! and acts on what it returns. The `native-sync` feature provides a tokio
//! driver in [`native`].
//!
//! ## Local edits
//!
//! The session subscribes to its [`ReplicatedDoc`]. Every local delta is
//! written to the open transport immediately. While no transport is open
//! the delta stays only inside the document; the next `on_open` pushes the
//! full document state instead of replaying a queue.
//!
//! ## Remote edits
//!
//! Binary frames are merged with [`UpdateOrigin::Remote`]. Remote merges
//! never produce an outgoing frame, so a delta is never echoed back.

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub mod native;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::crdt::{DocEvent, ReplicatedDoc, RoomKey, SubscriptionId, UpdateOrigin};
use crate::error::{Result, TandemError};
use crate::presence::{AwarenessPatch, AwarenessState, PresenceRegistry};
use crate::protocol::{Frame, RawFrame, decode_frame};
use crate::reconnect::{ReconnectConfig, ReconnectDecision, ReconnectPolicy, ReconnectState};

#[cfg(all(not(target_arch = "wasm32"), feature = "native-sync"))]
pub use native::{SyncSessionHandle, close_session, open_session};

/// Outgoing half of an open transport.
///
/// `send` must not block; an implementation typically pushes onto a
/// channel drained by the socket writer.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: RawFrame) -> Result<()>;
}

/// Error surfaced to the caller through [`ConnectionState::last_error`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },
}

impl From<SessionError> for TandemError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(msg) => TandemError::Transport(msg),
            SessionError::MaxReconnectAttemptsExceeded { attempts } => {
                TandemError::MaxReconnectAttemptsExceeded { attempts }
            }
        }
    }
}

/// Connection and convergence state of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Transport is open.
    pub connected: bool,
    /// The first full state of this connection lifetime has been merged.
    pub synced: bool,
    pub last_error: Option<SessionError>,
}

/// Liveness probing on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(45),
        }
    }
}

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base WebSocket URL of the sync endpoint (e.g. `ws://localhost:3030/sync`)
    pub server_url: String,
    pub room: RoomKey,
    /// Local identity, sent as the initial awareness state
    pub identity: AwarenessState,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, room: RoomKey, identity: AwarenessState) -> Self {
        Self {
            server_url: server_url.into(),
            room,
            identity,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    SentPing,
    /// Nothing was received within the timeout; close the transport.
    TimedOut,
}

type SharedSink = Arc<Mutex<Option<Arc<dyn FrameSink>>>>;
type StateObserver = Arc<dyn Fn(&ConnectionState) + Send + Sync>;
type AwarenessObserver = Arc<dyn Fn(&[AwarenessState]) + Send + Sync>;

/// Sans-IO client sync session.
pub struct SyncSession {
    doc: Arc<ReplicatedDoc>,
    room: RoomKey,
    local: AwarenessState,
    presence: PresenceRegistry,
    state: ConnectionState,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatConfig,
    sink: SharedSink,
    subscription: SubscriptionId,
    last_received: Option<Instant>,
    last_ping: Option<Instant>,
    state_observers: Vec<StateObserver>,
    awareness_observers: Vec<AwarenessObserver>,
}

impl SyncSession {
    /// Create a session with a fresh empty document.
    pub fn new(config: &SessionConfig) -> Self {
        let doc = Arc::new(ReplicatedDoc::new(config.room.room_type));
        Self::with_doc(config, doc)
    }

    /// Create a session around an existing document, e.g. one kept from a
    /// previous session.
    pub fn with_doc(config: &SessionConfig, doc: Arc<ReplicatedDoc>) -> Self {
        let sink: SharedSink = Arc::new(Mutex::new(None));

        let forward = Arc::clone(&sink);
        let subscription = doc.subscribe(Arc::new(move |event: &DocEvent| {
            // Remote merges are intentionally not forwarded
            let DocEvent::Local { delta } = event else {
                return;
            };
            let sink = forward
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match sink {
                Some(sink) => {
                    if let Err(e) = sink.send(RawFrame::Binary(delta.clone())) {
                        log::warn!("[SyncSession] Failed to send local delta: {}", e);
                    }
                }
                None => log::debug!(
                    "[SyncSession] Transport closed, keeping {} byte delta in document",
                    delta.len()
                ),
            }
        }));

        Self {
            doc,
            room: config.room.clone(),
            local: config.identity.clone(),
            presence: PresenceRegistry::new(),
            state: ConnectionState::default(),
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            heartbeat: config.heartbeat.clone(),
            sink,
            subscription,
            last_received: None,
            last_ping: None,
            state_observers: Vec::new(),
            awareness_observers: Vec::new(),
        }
    }

    pub fn doc(&self) -> &Arc<ReplicatedDoc> {
        &self.doc
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.policy.state()
    }

    pub fn local_awareness(&self) -> &AwarenessState {
        &self.local
    }

    /// Current participants as last reported by the server.
    pub fn participants(&self) -> Vec<AwarenessState> {
        self.presence.participants()
    }

    /// Register a connection state observer.
    pub fn on_state_change(&mut self, observer: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.state_observers.push(Arc::new(observer));
    }

    /// Register an observer receiving the full participant list.
    pub fn on_awareness(&mut self, observer: impl Fn(&[AwarenessState]) + Send + Sync + 'static) {
        self.awareness_observers.push(Arc::new(observer));
    }

    fn notify_state(&self) {
        for observer in &self.state_observers {
            observer(&self.state);
        }
    }

    fn notify_awareness(&self) {
        let participants = self.presence.participants();
        for observer in &self.awareness_observers {
            observer(&participants);
        }
    }

    fn current_sink(&self) -> Option<Arc<dyn FrameSink>> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) -> Option<Arc<dyn FrameSink>> {
        let mut guard = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, sink)
    }

    /// Send a frame if the transport is open. Returns whether it was
    /// handed to the transport.
    pub fn send(&self, frame: &Frame) -> Result<bool> {
        let Some(sink) = self.current_sink() else {
            return Ok(false);
        };
        sink.send(frame.encode()?)?;
        Ok(true)
    }

    // ==================== Lifecycle ====================

    /// Ask for a connection. Clears `last_error`.
    ///
    /// Returns `true` when the driver should open a transport now, `false`
    /// when one is already open or opening.
    pub fn connect(&mut self) -> bool {
        let should_open = self.policy.connect_requested();
        if self.state.last_error.take().is_some() {
            self.notify_state();
        }
        if should_open {
            log::info!("[SyncSession] Connecting to room {}", self.room);
        }
        should_open
    }

    /// A transport opened. Starts a new connection lifetime and performs
    /// the full state exchange from this side.
    pub fn on_open(&mut self, sink: Arc<dyn FrameSink>, now: Instant) {
        self.policy.on_connected();
        self.set_sink(Some(sink));
        self.last_received = Some(now);
        self.last_ping = Some(now);
        self.state = ConnectionState {
            connected: true,
            synced: false,
            last_error: None,
        };
        log::info!("[SyncSession] Connected to room {}", self.room);

        if !self.doc.is_empty() {
            let state = self.doc.encode_state_as_update();
            if let Err(e) = self.send(&Frame::Delta(state)) {
                log::warn!("[SyncSession] Failed to send local state: {}", e);
            }
        }
        if let Err(e) = self.send(&Frame::awareness(&self.local)) {
            log::warn!("[SyncSession] Failed to send awareness: {}", e);
        }

        self.notify_state();
    }

    /// Handle one incoming frame.
    ///
    /// # Errors
    ///
    /// Returns [`TandemError::Decode`] if the frame is malformed. The
    /// connection and the document are unaffected; the caller should log
    /// and continue.
    pub fn on_frame(&mut self, raw: RawFrame, now: Instant) -> Result<()> {
        if !self.state.connected {
            log::debug!("[SyncSession] Ignoring frame received while disconnected");
            return Ok(());
        }
        self.last_received = Some(now);

        match decode_frame(raw)? {
            Frame::Delta(bytes) => {
                self.doc.apply_update(&bytes, UpdateOrigin::Remote)?;
                if !self.state.synced {
                    self.state.synced = true;
                    log::info!("[SyncSession] Room {} synced", self.room);
                    self.notify_state();
                }
            }
            Frame::Awareness {
                participant_id,
                state,
            } => {
                if self.presence.upsert(&participant_id, state) {
                    self.notify_awareness();
                }
            }
            Frame::Presence(entries) => {
                self.presence.replace_all(entries);
                self.notify_awareness();
            }
            Frame::Ping => {
                self.send(&Frame::Pong)?;
            }
            Frame::Pong => {}
            Frame::Unknown => {
                log::debug!("[SyncSession] Ignoring unknown control message");
            }
        }
        Ok(())
    }

    /// The transport closed or failed to open.
    ///
    /// Returns what the driver should do next. An unrequested close sets
    /// `last_error` but leaves `synced` as it was.
    pub fn on_closed(&mut self, reason: impl Into<String>) -> ReconnectDecision {
        self.set_sink(None);
        self.last_received = None;
        self.last_ping = None;

        let decision = self.policy.on_disconnected();
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                let reason = reason.into();
                log::warn!(
                    "[SyncSession] Connection lost ({}), retry {} in {:?}",
                    reason,
                    attempt + 1,
                    delay
                );
                self.state.last_error = Some(SessionError::Transport(reason));
            }
            ReconnectDecision::GaveUp { attempts } => {
                log::error!(
                    "[SyncSession] Giving up on room {} after {} attempts",
                    self.room,
                    attempts
                );
                self.state.last_error =
                    Some(SessionError::MaxReconnectAttemptsExceeded { attempts });
                self.presence.clear();
                self.notify_awareness();
            }
            ReconnectDecision::Stop => {}
        }
        self.state.connected = false;
        self.notify_state();
        decision
    }

    /// The backoff timer fired. Returns `true` if the driver should open
    /// a transport now.
    pub fn retry_due(&mut self) -> bool {
        self.policy.retry_started()
    }

    /// Intentional teardown.
    ///
    /// Cancels any pending retry and clears the participant view. The
    /// document is left intact. Returns `true` if a transport was open and
    /// the driver must close it.
    pub fn disconnect(&mut self) -> bool {
        if self.policy.stop() {
            log::info!("[SyncSession] Cancelled pending reconnect");
        }
        let had_transport = self.set_sink(None).is_some();
        self.last_received = None;
        self.last_ping = None;

        let was_connected = self.state.connected;
        self.state.connected = false;
        if !self.presence.is_empty() {
            self.presence.clear();
            self.notify_awareness();
        }
        if was_connected {
            log::info!("[SyncSession] Disconnected from room {}", self.room);
            self.notify_state();
        }
        had_transport
    }

    /// Drive the heartbeat.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if !self.state.connected {
            return TickOutcome::Idle;
        }
        let (Some(last_received), Some(last_ping)) = (self.last_received, self.last_ping) else {
            return TickOutcome::Idle;
        };

        if now.saturating_duration_since(last_received) >= self.heartbeat.pong_timeout {
            log::warn!(
                "[SyncSession] No frames for {:?}, treating connection as dead",
                self.heartbeat.pong_timeout
            );
            return TickOutcome::TimedOut;
        }
        if now.saturating_duration_since(last_ping) >= self.heartbeat.ping_interval {
            self.last_ping = Some(now);
            return match self.send(&Frame::Ping) {
                Ok(true) => TickOutcome::SentPing,
                Ok(false) => TickOutcome::Idle,
                Err(e) => {
                    log::warn!("[SyncSession] Failed to send ping: {}", e);
                    TickOutcome::Idle
                }
            };
        }
        TickOutcome::Idle
    }

    // ==================== Awareness ====================

    /// Merge a partial update into the local awareness state and send the
    /// full state immediately if connected.
    pub fn update_local_awareness(&mut self, patch: AwarenessPatch) -> Result<()> {
        self.local.apply_patch(patch);
        if self.state.connected {
            let id = self.local.participant_id.clone();
            if self.presence.upsert(&id, self.local.clone()) {
                self.notify_awareness();
            }
        }
        self.send(&Frame::awareness(&self.local))?;
        Ok(())
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.doc.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("room", &self.room)
            .field("state", &self.state)
            .field("reconnect", &self.policy.state())
            .finish()
    }
}
