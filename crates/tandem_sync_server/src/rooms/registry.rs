//! Lazily created, evictable set of room coordinators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tandem_core::crdt::{ReplicatedDoc, RoomKey, SnapshotStore};
use tandem_core::error::TandemError;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::coordinator::{ConnectionId, Outbound, RoomCoordinator, RoomHandle, RoomSettings, RoomStats};

/// How many times an attach is retried when it races an eviction.
const ATTACH_ATTEMPTS: usize = 3;

/// Statistics about all active rooms
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub active_rooms: usize,
    pub active_connections: usize,
    pub rooms: Vec<RoomStats>,
}

/// Global room state
pub struct RoomRegistry {
    /// Running coordinators by room
    rooms: Mutex<HashMap<RoomKey, RoomHandle>>,
    storage: Arc<dyn SnapshotStore>,
    settings: RoomSettings,
    idle_timeout: Duration,
}

impl RoomRegistry {
    pub fn new(storage: Arc<dyn SnapshotStore>, settings: RoomSettings, idle_timeout: Duration) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            storage,
            settings,
            idle_timeout,
        }
    }

    /// Get the coordinator for a room, starting it from the stored
    /// snapshot if it is not running.
    ///
    /// The registry lock is not held while the snapshot loads. If another
    /// caller started the room in the meantime, its coordinator wins.
    pub async fn get_or_create_room(&self, key: &RoomKey) -> Result<RoomHandle, TandemError> {
        if let Some(handle) = self.running(key).await {
            return Ok(handle);
        }

        let storage = Arc::clone(&self.storage);
        let name = key.storage_key();
        let snapshot = tokio::task::spawn_blocking(move || storage.load_doc(&name))
            .await
            .map_err(|e| TandemError::Persistence(format!("snapshot load task failed: {}", e)))??;

        let doc = match snapshot {
            Some(bytes) => {
                info!("Loaded room {} from snapshot ({} bytes)", key, bytes.len());
                ReplicatedDoc::from_snapshot(key.room_type, &bytes)?
            }
            None => ReplicatedDoc::new(key.room_type),
        };

        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(key) {
            if !handle.is_closed() {
                debug!("Room {} was started concurrently, discarding loaded copy", key);
                return Ok(handle.clone());
            }
        }

        let handle = RoomCoordinator::spawn(
            key.clone(),
            doc,
            Arc::clone(&self.storage),
            self.settings.clone(),
        );
        rooms.insert(key.clone(), handle.clone());
        info!("Created room {}", key);
        Ok(handle)
    }

    /// The live coordinator for `key`, dropping a stopped one.
    async fn running(&self, key: &RoomKey) -> Option<RoomHandle> {
        let mut rooms = self.rooms.lock().await;
        let handle = rooms.get(key)?;
        if !handle.is_closed() {
            return Some(handle.clone());
        }
        debug!("Replacing stopped coordinator for {}", key);
        rooms.remove(key);
        None
    }

    /// Attach a connection to a room, creating the room if needed.
    pub async fn attach(
        &self,
        key: &RoomKey,
        conn: ConnectionId,
        participant: Option<String>,
        outbound: Outbound,
    ) -> Result<RoomHandle, TandemError> {
        let mut last_error = TandemError::RoomClosed(key.to_string());
        for _ in 0..ATTACH_ATTEMPTS {
            let handle = self.get_or_create_room(key).await?;
            match handle
                .attach(conn, participant.clone(), outbound.clone())
                .await
            {
                Ok(()) => return Ok(handle),
                // The coordinator stopped between lookup and attach
                Err(e @ TandemError::RoomClosed(_)) => last_error = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Evict a room if it has no connections. Returns whether it is gone.
    ///
    /// The final flush runs without the registry lock; the entry is then
    /// removed only if it still belongs to the evicted coordinator.
    pub async fn evict_if_idle(&self, key: &RoomKey) -> bool {
        let Some(handle) = self.rooms.lock().await.get(key).cloned() else {
            return true;
        };

        let evicted = match handle.try_evict().await {
            Ok(true) | Err(TandemError::RoomClosed(_)) => true,
            Ok(false) => false,
            Err(e) => {
                warn!("Eviction of {} failed: {}", key, e);
                false
            }
        };
        if !evicted {
            return false;
        }

        let mut rooms = self.rooms.lock().await;
        if rooms.get(key).is_some_and(|current| current.same_room(&handle)) {
            rooms.remove(key);
        }
        info!("Removed idle room {}", key);
        true
    }

    /// Evict `key` after the idle timeout unless someone rejoined.
    pub fn schedule_eviction(self: &Arc<Self>, key: RoomKey) {
        let registry = Arc::clone(self);
        let delay = self.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.evict_if_idle(&key).await;
        });
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Get statistics about all running rooms
    pub async fn stats(&self) -> ServerStats {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.values().cloned().collect();

        let mut rooms = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.stats().await {
                Ok(stats) => rooms.push(stats),
                Err(e) => debug!("Skipping stats for {}: {}", handle.key(), e),
            }
        }
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        ServerStats {
            active_rooms: rooms.len(),
            active_connections: rooms.iter().map(|r| r.connections).sum(),
            rooms,
        }
    }

    /// Flush every room and stop tracking them. Used on shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.drain().map(|(_, h)| h).collect();
        info!("Flushing {} rooms", handles.len());
        for handle in handles {
            if let Err(e) = handle.flush().await {
                error!("Failed to flush room {} on shutdown: {}", handle.key(), e);
            }
        }
    }
}
