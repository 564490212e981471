//! Background snapshot writer for one room.
//!
//! The coordinator hands over whole snapshots and moves on. Only the
//! newest snapshot matters: one that arrives while an older one is waiting
//! replaces it. Failed writes are retried with exponential backoff without
//! ever blocking the coordinator.

use std::sync::Arc;
use std::time::Duration;

use tandem_core::crdt::SnapshotStore;
use tandem_core::error::TandemError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Longest wait between two background retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PersistSettings {
    pub retry_base: Duration,
    /// Attempts a flush makes before reporting failure
    pub max_flush_attempts: u32,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(250),
            max_flush_attempts: 5,
        }
    }
}

enum PersistCommand {
    Store(Vec<u8>),
    Flush {
        snapshot: Vec<u8>,
        ack: oneshot::Sender<Result<(), TandemError>>,
    },
}

/// Handle to a room's snapshot writer task.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl Persister {
    /// Spawn the writer for the snapshot stored under `name`.
    pub fn spawn(storage: Arc<dyn SnapshotStore>, name: String, settings: PersistSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Writer {
            storage,
            name,
            settings,
            pending: None,
            failures: 0,
            retry_at: None,
        };
        tokio::spawn(writer.run(rx));
        Self { tx }
    }

    /// Queue a snapshot for writing.
    pub fn store(&self, snapshot: Vec<u8>) {
        if self.tx.send(PersistCommand::Store(snapshot)).is_err() {
            error!("Snapshot writer has stopped, dropping snapshot");
        }
    }

    /// Write a snapshot and wait for the outcome.
    ///
    /// Makes at most `max_flush_attempts` attempts.
    pub async fn flush(&self, snapshot: Vec<u8>) -> Result<(), TandemError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush { snapshot, ack })
            .map_err(|_| TandemError::Persistence("snapshot writer has stopped".to_string()))?;
        done.await
            .map_err(|_| TandemError::Persistence("snapshot writer has stopped".to_string()))?
    }
}

struct Writer {
    storage: Arc<dyn SnapshotStore>,
    name: String,
    settings: PersistSettings,
    pending: Option<Vec<u8>>,
    /// Consecutive failed writes of the pending snapshot
    failures: u32,
    retry_at: Option<Instant>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
        loop {
            let ready =
                self.pending.is_some() && self.retry_at.is_none_or(|at| at <= Instant::now());
            let wake = self.retry_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                command = rx.recv() => match command {
                    Some(PersistCommand::Store(snapshot)) => {
                        self.pending = Some(snapshot);
                    }
                    Some(PersistCommand::Flush { snapshot, ack }) => {
                        self.pending = Some(snapshot);
                        let result = self.flush_pending().await;
                        let _ = ack.send(result);
                    }
                    None => {
                        if self.pending.is_some() {
                            if let Err(e) = self.flush_pending().await {
                                error!("Dropping unsaved snapshot for {}: {}", self.name, e);
                            }
                        }
                        break;
                    }
                },

                _ = std::future::ready(()), if ready => {
                    self.write_pending().await;
                }

                _ = tokio::time::sleep_until(wake), if self.pending.is_some() && !ready => {}
            }
        }
        debug!("Snapshot writer for {} stopped", self.name);
    }

    /// Try the pending snapshot once. On failure schedule a retry.
    async fn write_pending(&mut self) -> bool {
        let Some(snapshot) = self.pending.take() else {
            return true;
        };
        match self.save(&snapshot).await {
            Ok(()) => {
                debug!("Saved snapshot {} ({} bytes)", self.name, snapshot.len());
                self.failures = 0;
                self.retry_at = None;
                true
            }
            Err(e) => {
                let delay = self.backoff(self.failures);
                self.failures += 1;
                warn!(
                    "Failed to save snapshot {} (attempt {}), retrying in {:?}: {}",
                    self.name, self.failures, delay, e
                );
                self.retry_at = Some(Instant::now() + delay);
                self.pending = Some(snapshot);
                false
            }
        }
    }

    async fn flush_pending(&mut self) -> Result<(), TandemError> {
        self.retry_at = None;
        for attempt in 0..self.settings.max_flush_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }
            self.retry_at = None;
            if self.write_pending().await {
                return Ok(());
            }
        }
        error!(
            "Giving up flushing snapshot {} after {} attempts",
            self.name, self.settings.max_flush_attempts
        );
        Err(TandemError::Persistence(format!(
            "flush of {} failed after {} attempts",
            self.name, self.settings.max_flush_attempts
        )))
    }

    async fn save(&self, snapshot: &[u8]) -> Result<(), TandemError> {
        let storage = Arc::clone(&self.storage);
        let name = self.name.clone();
        let snapshot = snapshot.to_vec();
        tokio::task::spawn_blocking(move || storage.save_doc(&name, &snapshot))
            .await
            .map_err(|e| TandemError::Persistence(format!("snapshot write task failed: {}", e)))?
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.settings
            .retry_base
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::crdt::MemoryStorage;

    fn settings() -> PersistSettings {
        PersistSettings {
            retry_base: Duration::from_millis(5),
            max_flush_attempts: 3,
        }
    }

    async fn wait_for_saves(storage: &MemoryStorage, count: usize) {
        for _ in 0..200 {
            if storage.save_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} saves, saw {}", storage.save_count());
    }

    #[tokio::test]
    async fn test_store_writes_in_background() {
        let storage = Arc::new(MemoryStorage::new());
        let persister = Persister::spawn(storage.clone(), "map:doc".into(), settings());
        persister.store(vec![1, 2, 3]);
        wait_for_saves(&storage, 1).await;
        assert_eq!(storage.load_doc("map:doc").unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_failed_write_is_retried() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_saves(2);
        let persister = Persister::spawn(storage.clone(), "map:doc".into(), settings());
        persister.store(vec![9]);
        wait_for_saves(&storage, 1).await;
        assert_eq!(storage.load_doc("map:doc").unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_newest_snapshot_wins_after_retry() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_saves(1);
        let persister = Persister::spawn(storage.clone(), "map:doc".into(), settings());
        persister.store(vec![1]);
        persister.store(vec![2]);
        persister.flush(vec![3]).await.unwrap();
        assert_eq!(storage.load_doc("map:doc").unwrap(), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_flush_is_bounded() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_saves(10);
        let persister = Persister::spawn(storage.clone(), "map:doc".into(), settings());
        let err = persister.flush(vec![1]).await.unwrap_err();
        assert!(matches!(err, TandemError::Persistence(_)));
        assert_eq!(storage.save_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_flushes_pending() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_saves(1);
        let persister = Persister::spawn(storage.clone(), "map:doc".into(), settings());
        persister.store(vec![4]);
        drop(persister);
        wait_for_saves(&storage, 1).await;
        assert_eq!(storage.load_doc("map:doc").unwrap(), Some(vec![4]));
    }
}
