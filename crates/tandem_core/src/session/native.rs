//! Native WebSocket driver for [`SyncSession`].
//!
//! [`open_session`] spawns one tokio task per session. The task owns the
//! [`SyncSession`] and the socket, and is steered through a command
//! channel by the returned [`SyncSessionHandle`]. Connection state and the
//! participant list are published on `watch` channels.
//!
//! ```ignore
//! let handle = open_session(config)?;
//! handle.state_changes().wait_for(|s| s.synced).await?;
//! handle.doc().map_set("title", json!("Hello"))?;
//! close_session(handle).await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{ConnectionState, FrameSink, SessionConfig, SyncSession, TickOutcome};
use crate::crdt::{ReplicatedDoc, RoomKey};
use crate::error::{Result, TandemError};
use crate::presence::{AwarenessPatch, AwarenessState};
use crate::protocol::RawFrame;
use crate::reconnect::ReconnectDecision;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    UpdateAwareness(AwarenessPatch),
    Shutdown,
}

/// What the driver loop does next.
enum Phase {
    Idle,
    Connect,
    Backoff(Duration),
    Exit,
}

/// Frames queued for the socket writer of one connection.
struct ChannelSink(mpsc::UnboundedSender<RawFrame>);

impl FrameSink for ChannelSink {
    fn send(&self, frame: RawFrame) -> Result<()> {
        self.0
            .send(frame)
            .map_err(|_| TandemError::Transport("connection writer has stopped".to_string()))
    }
}

/// Caller-facing handle to a running session.
pub struct SyncSessionHandle {
    doc: Arc<ReplicatedDoc>,
    room: RoomKey,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    participants: watch::Receiver<Vec<AwarenessState>>,
    task: Option<JoinHandle<()>>,
}

impl SyncSessionHandle {
    /// The session's document. Mutations made through it are sent to the
    /// room while connected.
    pub fn doc(&self) -> &Arc<ReplicatedDoc> {
        &self.doc
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn participants(&self) -> Vec<AwarenessState> {
        self.participants.borrow().clone()
    }

    /// Receiver for connection state updates.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Receiver for participant list updates.
    pub fn participant_changes(&self) -> watch::Receiver<Vec<AwarenessState>> {
        self.participants.clone()
    }

    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Close the transport without reconnecting. The document is kept.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn update_local_awareness(&self, patch: AwarenessPatch) -> Result<()> {
        self.command(Command::UpdateAwareness(patch))
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TandemError::RoomClosed(self.room.to_string()))
    }
}

impl Drop for SyncSessionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Open a session on a fresh document and start connecting.
///
/// Must be called from within a tokio runtime.
pub fn open_session(config: SessionConfig) -> Result<SyncSessionHandle> {
    let doc = Arc::new(ReplicatedDoc::new(config.room.room_type));
    open_session_with_doc(config, doc)
}

/// Open a session around an existing document and start connecting.
pub fn open_session_with_doc(
    config: SessionConfig,
    doc: Arc<ReplicatedDoc>,
) -> Result<SyncSessionHandle> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| TandemError::Transport(format!("No tokio runtime: {}", e)))?;
    let url = build_session_url(&config)?;

    let mut session = SyncSession::with_doc(&config, Arc::clone(&doc));

    let (state_tx, state_rx) = watch::channel(ConnectionState::default());
    let (participants_tx, participants_rx) = watch::channel(Vec::new());
    session.on_state_change(move |state| {
        state_tx.send_replace(state.clone());
    });
    session.on_awareness(move |participants| {
        participants_tx.send_replace(participants.to_vec());
    });

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        session,
        url,
        config: config.clone(),
        commands: commands_rx,
    };
    let task = runtime.spawn(driver.run());

    Ok(SyncSessionHandle {
        doc,
        room: config.room,
        commands: commands_tx,
        state: state_rx,
        participants: participants_rx,
        task: Some(task),
    })
}

/// Shut a session down and wait for its task to finish.
pub async fn close_session(mut handle: SyncSessionHandle) {
    let _ = handle.commands.send(Command::Shutdown);
    if let Some(task) = handle.task.take() {
        if let Err(e) = task.await {
            log::warn!("[SyncSession] Session task ended abnormally: {}", e);
        }
    }
}

/// Build `<server_url>?room=..&type=..&participant=..`.
pub fn build_session_url(config: &SessionConfig) -> Result<Url> {
    let mut url = Url::parse(&config.server_url)
        .map_err(|e| TandemError::Transport(format!("Invalid server URL: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("room", &config.room.room_id)
        .append_pair("type", &config.room.room_type.to_string())
        .append_pair("participant", &config.identity.participant_id);
    Ok(url)
}

struct Driver {
    session: SyncSession,
    url: Url,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        let mut phase = if self.session.connect() {
            Phase::Connect
        } else {
            Phase::Idle
        };

        loop {
            phase = match phase {
                Phase::Idle => self.wait_for_command().await,
                Phase::Backoff(delay) => self.backoff(delay).await,
                Phase::Connect => self.connect_once().await,
                Phase::Exit => break,
            };
        }

        self.session.disconnect();
        log::debug!("[SyncSession] Driver for {} stopped", self.session.room());
    }

    fn apply_awareness(&mut self, patch: AwarenessPatch) {
        if let Err(e) = self.session.update_local_awareness(patch) {
            log::warn!("[SyncSession] Failed to send awareness: {}", e);
        }
    }

    async fn wait_for_command(&mut self) -> Phase {
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => return Phase::Exit,
                Some(Command::Connect) => {
                    if self.session.connect() {
                        return Phase::Connect;
                    }
                }
                Some(Command::Disconnect) => {
                    self.session.disconnect();
                }
                Some(Command::UpdateAwareness(patch)) => self.apply_awareness(patch),
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Phase {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    return if self.session.retry_due() { Phase::Connect } else { Phase::Idle };
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Phase::Exit,
                    Some(Command::Disconnect) => {
                        self.session.disconnect();
                        return Phase::Idle;
                    }
                    Some(Command::Connect) => {
                        if self.session.connect() {
                            return Phase::Connect;
                        }
                    }
                    Some(Command::UpdateAwareness(patch)) => self.apply_awareness(patch),
                }
            }
        }
    }

    fn after_close(&mut self, reason: String) -> Phase {
        match self.session.on_closed(reason) {
            ReconnectDecision::Retry { delay, .. } => Phase::Backoff(delay),
            ReconnectDecision::GaveUp { .. } | ReconnectDecision::Stop => Phase::Idle,
        }
    }

    async fn connect_once(&mut self) -> Phase {
        log::info!("[SyncSession] Opening {}", self.url);

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.url.to_string()),
        );
        tokio::pin!(connect);

        // A teardown requested mid-handshake waits for the handshake to end
        let mut stop_requested: Option<Phase> = None;
        let result = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => stop_requested = Some(Phase::Exit),
                    Some(Command::Disconnect) => {
                        if stop_requested.is_none() {
                            stop_requested = Some(Phase::Idle);
                        }
                    }
                    Some(Command::Connect) => {}
                    Some(Command::UpdateAwareness(patch)) => self.apply_awareness(patch),
                }
            }
        };

        if let Some(next) = stop_requested {
            if let Ok(Ok((mut ws, _))) = result {
                if let Err(e) = ws.close(None).await {
                    log::debug!("[SyncSession] Close after handshake failed: {}", e);
                }
            }
            self.session.disconnect();
            return next;
        }

        match result {
            Ok(Ok((ws, _response))) => self.run_connection(ws).await,
            Ok(Err(e)) => {
                log::warn!("[SyncSession] Connection failed: {}", e);
                self.after_close(e.to_string())
            }
            Err(_) => {
                log::warn!(
                    "[SyncSession] Connection timed out after {:?}",
                    self.config.connect_timeout
                );
                self.after_close("connect timeout".to_string())
            }
        }
    }

    async fn run_connection(&mut self, ws: WsStream) -> Phase {
        let (mut write, mut read) = ws.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<RawFrame>();
        self.session
            .on_open(Arc::new(ChannelSink(outgoing_tx)), Instant::now().into_std());

        let mut heartbeat = tokio::time::interval(heartbeat_period(&self.config));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let outcome: std::result::Result<Phase, String> = loop {
            tokio::select! {
                msg = read.next() => {
                    let raw = match msg {
                        Some(Ok(Message::Binary(bytes))) => RawFrame::Binary(bytes.to_vec()),
                        Some(Ok(Message::Text(text))) => RawFrame::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Close(_))) => break Err("closed by server".to_string()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Err(e.to_string()),
                        None => break Err("connection ended".to_string()),
                    };
                    match self.session.on_frame(raw, Instant::now().into_std()) {
                        Ok(()) => {}
                        Err(e) if e.is_frame_local() => {
                            log::warn!("[SyncSession] Dropping frame: {}", e);
                        }
                        Err(e) => break Err(e.to_string()),
                    }
                }
                Some(frame) = outgoing_rx.recv() => {
                    if let Err(e) = write.send(to_message(frame)).await {
                        break Err(e.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    if self.session.tick(Instant::now().into_std()) == TickOutcome::TimedOut {
                        break Err("heartbeat timeout".to_string());
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break Ok(Phase::Exit),
                    Some(Command::Disconnect) => break Ok(Phase::Idle),
                    Some(Command::Connect) => {}
                    Some(Command::UpdateAwareness(patch)) => self.apply_awareness(patch),
                }
            }
        };

        match outcome {
            Ok(next) => {
                self.session.disconnect();
                // Frames queued before the teardown still belong to this connection
                while let Ok(frame) = outgoing_rx.try_recv() {
                    if write.send(to_message(frame)).await.is_err() {
                        break;
                    }
                }
                if let Err(e) = write.close().await {
                    log::debug!("[SyncSession] Close failed: {}", e);
                }
                next
            }
            Err(reason) => {
                let _ = write.close().await;
                self.after_close(reason)
            }
        }
    }
}

fn to_message(frame: RawFrame) -> Message {
    match frame {
        RawFrame::Binary(bytes) => Message::Binary(bytes.into()),
        RawFrame::Text(text) => Message::Text(text.into()),
    }
}

fn heartbeat_period(config: &SessionConfig) -> Duration {
    let shortest = config
        .heartbeat
        .ping_interval
        .min(config.heartbeat.pong_timeout);
    (shortest / 2).max(Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::RoomType;
    use crate::session::SessionError;

    fn config() -> SessionConfig {
        SessionConfig::new(
            "ws://127.0.0.1:3030/sync",
            RoomKey::new("doc 1", RoomType::RichText),
            AwarenessState::new("p-1", "Pat", "#abcdef"),
        )
    }

    #[test]
    fn test_build_session_url() {
        let url = build_session_url(&config()).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:3030/sync?room=doc+1&type=rich_text&participant=p-1"
        );
    }

    #[test]
    fn test_invalid_server_url() {
        let mut cfg = config();
        cfg.server_url = "not a url".into();
        assert!(matches!(
            build_session_url(&cfg),
            Err(TandemError::Transport(_))
        ));
    }

    #[test]
    fn test_open_session_outside_runtime_fails() {
        assert!(open_session(config()).is_err());
    }

    #[test]
    fn test_heartbeat_period() {
        let mut cfg = config();
        assert_eq!(heartbeat_period(&cfg), Duration::from_millis(7500));
        cfg.heartbeat.ping_interval = Duration::from_millis(4);
        assert_eq!(heartbeat_period(&cfg), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = config();
        cfg.server_url = format!("ws://127.0.0.1:{}/sync", port);
        cfg.reconnect.base_delay = Duration::from_millis(5);
        cfg.reconnect.max_attempts = 2;

        let handle = open_session(cfg).unwrap();
        let mut states = handle.state_changes();
        let state = tokio::time::timeout(
            Duration::from_secs(10),
            states.wait_for(|s| {
                matches!(
                    s.last_error,
                    Some(SessionError::MaxReconnectAttemptsExceeded { .. })
                )
            }),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(
            state.last_error,
            Some(SessionError::MaxReconnectAttemptsExceeded { attempts: 2 })
        );
        assert!(!state.connected);
        close_session(handle).await;
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_closes_after_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config();
        cfg.server_url = format!("ws://{}/sync", listener.local_addr().unwrap());
        cfg.reconnect.base_delay = Duration::from_millis(5);

        let handle = open_session(cfg).unwrap();
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();

        // The upgrade request is pending until the server answers it
        handle.disconnect().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(first, Message::Close(_)), "got {first:?}");

        assert!(!handle.state().connected);
        assert!(handle.state().last_error.is_none());
        // No reconnect follows an explicit disconnect
        assert!(
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err()
        );
        close_session(handle).await;
    }
}
