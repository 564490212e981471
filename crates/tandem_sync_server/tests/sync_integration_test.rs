//! End-to-end tests running the server on a loopback port

use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_core::crdt::{MemoryStorage, RoomKey, RoomType, SnapshotStore, SqliteStorage};
use tandem_core::protocol::{ControlMessage, decode_control};
use tandem_core::session::{SessionConfig, SyncSessionHandle, close_session, open_session};
use tandem_core::{AwarenessState, ReplicatedDoc, UpdateOrigin};
use tandem_sync_server::{Config, build_router, rooms::RoomRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
}

impl TestServer {
    async fn start(storage: Arc<dyn SnapshotStore>, idle_timeout: Duration) -> Self {
        let config = Config {
            persist_debounce: Duration::from_millis(20),
            room_idle_timeout: idle_timeout,
            ..Config::default()
        };
        let registry = Arc::new(RoomRegistry::new(
            storage,
            config.room_settings(),
            config.room_idle_timeout,
        ));
        let app = build_router(registry.clone(), &config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, registry }
    }

    fn sync_url(&self) -> String {
        format!("ws://{}/sync", self.addr)
    }

    fn session(&self, room: &RoomKey, participant: &str) -> SyncSessionHandle {
        let identity = AwarenessState::new(participant, participant, "#3366ff");
        open_session(SessionConfig::new(self.sync_url(), room.clone(), identity)).unwrap()
    }

    async fn raw_client(
        &self,
        room: &str,
        participant: &str,
    ) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>> {
        let url = format!(
            "{}?room={}&type=map&participant={}",
            self.sync_url(),
            room,
            participant
        );
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        ws
    }

    async fn http_get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}

/// TCP relay in front of the server whose link can be cut and restored.
struct Relay {
    addr: SocketAddr,
    open: Arc<AtomicBool>,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let open = Arc::new(AtomicBool::new(true));
        let links: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accepting = Arc::clone(&open);
        let tracked = Arc::clone(&links);
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                // While cut, connections are accepted and dropped at once
                if !accepting.load(Ordering::SeqCst) {
                    continue;
                }
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                tracked.lock().unwrap().push(link);
            }
        });

        Self { addr, open, links }
    }

    fn cut(&self) {
        self.open.store(false, Ordering::SeqCst);
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    fn restore(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_synced(session: &SyncSessionHandle) {
    wait_until("session to sync", || session.state().synced).await;
}

/// Read text frames until one decodes to a message matching `pred`.
async fn next_control<S>(ws: &mut S, pred: impl Fn(&ControlMessage) -> bool) -> ControlMessage
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let read = async {
        while let Some(msg) = ws.next().await {
            if let Message::Text(text) = msg.unwrap() {
                if let Ok(control) = decode_control(text.as_str()) {
                    if pred(&control) {
                        return control;
                    }
                }
            }
        }
        panic!("connection closed before the expected message");
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("expected control message")
}

fn presence_ids(msg: &ControlMessage) -> Vec<String> {
    match msg {
        ControlMessage::Presence { participants } => participants
            .iter()
            .map(|p| p.participant_id.clone())
            .collect(),
        _ => Vec::new(),
    }
}

fn awareness_frame(participant: &str) -> Message {
    let msg = ControlMessage::Awareness {
        participant_id: participant.to_string(),
        state: AwarenessState::new(participant, participant, "#ff0000"),
    };
    Message::text(serde_json::to_string(&msg).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_edits_converge_between_sessions() {
    let server = TestServer::start(Arc::new(MemoryStorage::new()), Duration::from_secs(30)).await;
    let room = RoomKey::new("doc-1", RoomType::Map);

    let alice = server.session(&room, "alice");
    let bob = server.session(&room, "bob");
    wait_synced(&alice).await;
    wait_synced(&bob).await;

    alice.doc().map_set("title", json!("Hello")).unwrap();
    wait_until("bob to see the title", || {
        bob.doc().map_get("title") == Some(json!("Hello"))
    })
    .await;

    bob.doc().map_set("subtitle", json!("World")).unwrap();
    wait_until("alice to see the subtitle", || {
        alice.doc().map_get("subtitle") == Some(json!("World"))
    })
    .await;

    assert_eq!(alice.doc().to_json(), bob.doc().to_json());

    close_session(alice).await;
    close_session(bob).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_joiner_receives_snapshot() {
    let server = TestServer::start(Arc::new(MemoryStorage::new()), Duration::from_secs(30)).await;
    let room = RoomKey::new("list", RoomType::Sequence);

    let writer = server.session(&room, "writer");
    let watcher = server.session(&room, "watcher");
    wait_synced(&writer).await;
    wait_synced(&watcher).await;

    writer.doc().seq_push(json!("first")).unwrap();
    writer.doc().seq_push(json!("second")).unwrap();
    wait_until("watcher to see both items", || watcher.doc().seq_len() == 2).await;

    let late = server.session(&room, "late");
    wait_synced(&late).await;
    wait_until("late joiner to load the snapshot", || late.doc().seq_len() == 2).await;
    assert_eq!(late.doc().seq_get(0), Some(json!("first")));
    assert_eq!(late.doc().seq_get(1), Some(json!("second")));

    close_session(writer).await;
    close_session(watcher).await;
    close_session(late).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offline_edits_merge_on_reconnect_without_duplication() {
    let server = TestServer::start(Arc::new(MemoryStorage::new()), Duration::from_secs(30)).await;
    let room = RoomKey::new("todo", RoomType::Sequence);

    let alice = server.session(&room, "alice");
    let bob = server.session(&room, "bob");
    wait_synced(&alice).await;
    wait_synced(&bob).await;

    alice.doc().seq_push(json!("shared")).unwrap();
    wait_until("bob to see the shared item", || bob.doc().seq_len() == 1).await;

    alice.disconnect().unwrap();
    wait_until("alice to disconnect", || !alice.state().connected).await;

    alice.doc().seq_push(json!("offline")).unwrap();
    bob.doc().seq_push(json!("online")).unwrap();

    alice.connect().unwrap();
    wait_synced(&alice).await;
    wait_until("both to hold three items", || {
        alice.doc().seq_len() == 3 && bob.doc().seq_len() == 3
    })
    .await;

    // Give any duplicate resend time to arrive
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.doc().seq_len(), 3);
    assert_eq!(bob.doc().seq_len(), 3);
    assert_eq!(alice.doc().to_json(), bob.doc().to_json());

    close_session(alice).await;
    close_session(bob).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_connection_reconnects_and_resends_offline_edits() {
    let server = TestServer::start(Arc::new(MemoryStorage::new()), Duration::from_secs(30)).await;
    let relay = Relay::start(server.addr).await;
    let room = RoomKey::new("flaky", RoomType::Sequence);

    let mut config = SessionConfig::new(
        format!("ws://{}/sync", relay.addr),
        room.clone(),
        AwarenessState::new("alice", "alice", "#3366ff"),
    );
    // Retries at 200ms, 600ms and 1400ms after a drop
    config.reconnect.base_delay = Duration::from_millis(200);
    config.reconnect.max_attempts = 3;
    let alice = open_session(config).unwrap();
    let bob = server.session(&room, "bob");
    wait_synced(&alice).await;
    wait_synced(&bob).await;

    alice.doc().seq_push(json!("shared")).unwrap();
    wait_until("bob to see the shared item", || bob.doc().seq_len() == 1).await;

    // Two outages in a row: the second only recovers if the first
    // successful reconnect reset the attempt count
    for round in 0..2 {
        relay.cut();
        wait_until("alice to notice the drop", || {
            let state = alice.state();
            !state.connected && state.last_error.is_some()
        })
        .await;
        assert!(alice.state().synced, "a drop must not clear synced");

        alice.doc().seq_push(json!(format!("offline-{round}"))).unwrap();
        bob.doc().seq_push(json!(format!("online-{round}"))).unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        relay.restore();

        let expected = 3 + 2 * round;
        wait_until("alice to reconnect and converge", || {
            let state = alice.state();
            state.connected
                && state.synced
                && state.last_error.is_none()
                && alice.doc().seq_len() == expected
                && bob.doc().seq_len() == expected
        })
        .await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.doc().seq_len(), 5);
    assert_eq!(alice.doc().to_json(), bob.doc().to_json());

    close_session(alice).await;
    close_session(bob).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_presence_is_removed_when_participant_leaves() {
    let server = TestServer::start(Arc::new(MemoryStorage::new()), Duration::from_secs(30)).await;

    let mut alice = server.raw_client("presence", "alice").await;
    let mut bob = server.raw_client("presence", "bob").await;

    alice.send(awareness_frame("alice")).await.unwrap();
    let seen = next_control(&mut bob, |m| presence_ids(m).contains(&"alice".to_string())).await;
    assert_eq!(presence_ids(&seen), vec!["alice".to_string()]);

    bob.send(awareness_frame("bob")).await.unwrap();
    next_control(&mut alice, |m| presence_ids(m).len() == 2).await;

    alice.close(None).await.unwrap();
    let after = next_control(&mut bob, |m| {
        matches!(m, ControlMessage::Presence { .. }) && !presence_ids(m).contains(&"alice".to_string())
    })
    .await;
    assert_eq!(presence_ids(&after), vec!["bob".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_frames_do_not_close_connection() {
    let server = TestServer::start(Arc::new(MemoryStorage::new()), Duration::from_secs(30)).await;
    let mut client = server.raw_client("robust", "carol").await;

    client.send(Message::text("not json")).await.unwrap();
    client.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    client.send(Message::text(r#"{"type":"from_the_future"}"#)).await.unwrap();
    client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();

    let reply = next_control(&mut client, |m| matches!(m, ControlMessage::Pong)).await;
    assert_eq!(reply, ControlMessage::Pong);

    let stats = server.registry.stats().await;
    assert_eq!(stats.active_connections, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_room_is_evicted_and_restored_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("rooms.db");
    let room = RoomKey::new("notes", RoomType::Map);

    {
        let storage = Arc::new(SqliteStorage::open(&db_path).unwrap());
        let server = TestServer::start(storage.clone(), Duration::from_millis(50)).await;

        let session = server.session(&room, "alice");
        wait_synced(&session).await;
        session.doc().map_set("body", json!("persist me")).unwrap();

        // Wait for the room to merge the edit
        let empty_snapshot = ReplicatedDoc::new(RoomType::Map).encode_state_as_update().len();
        for _ in 0..400 {
            let stats = server.registry.stats().await;
            if stats.rooms.iter().any(|r| r.snapshot_bytes > empty_snapshot) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        close_session(session).await;

        for _ in 0..400 {
            if server.registry.room_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.registry.room_count().await, 0);

        let saved = storage.load_doc(&room.storage_key()).unwrap().unwrap();
        let restored = ReplicatedDoc::new(RoomType::Map);
        restored.apply_update(&saved, UpdateOrigin::Snapshot).unwrap();
        assert_eq!(restored.map_get("body"), Some(json!("persist me")));
    }

    // A fresh server on the same database serves the saved state
    let storage = Arc::new(SqliteStorage::open(&db_path).unwrap());
    let server = TestServer::start(storage, Duration::from_secs(30)).await;
    let session = server.session(&room, "bob");
    wait_synced(&session).await;
    wait_until("restored value", || {
        session.doc().map_get("body") == Some(json!("persist me"))
    })
    .await;
    close_session(session).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_and_stats_endpoints() {
    let server = TestServer::start(Arc::new(MemoryStorage::new()), Duration::from_secs(30)).await;

    let health = server.http_get("/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.ends_with("OK"));

    let room = RoomKey::new("stats", RoomType::RichText);
    let session = server.session(&room, "dave");
    wait_synced(&session).await;

    let stats = server.http_get("/api/stats").await;
    assert!(stats.starts_with("HTTP/1.1 200"));
    assert!(stats.contains(r#""activeRooms":1"#));
    assert!(stats.contains(r#""roomId":"stats""#));
    assert!(stats.contains(r#""roomType":"rich_text""#));

    let url = format!("{}?room=x&type=spreadsheet", server.sync_url());
    match tokio_tungstenite::connect_async(url.as_str()).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("unknown room type was accepted"),
    }

    close_session(session).await;
}
