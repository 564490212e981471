use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::rooms::{PersistSettings, RoomSettings};

/// Where room snapshots are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// `rooms.db` inside the data directory
    Sqlite,
    /// Process memory; snapshots are lost on restart
    Memory,
}

impl FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageKind::Sqlite),
            "memory" => Ok(StorageKind::Memory),
            other => Err(ConfigError::InvalidStorage(other.to_string())),
        }
    }
}

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Directory holding the snapshot database (default: ./tandem_data)
    pub data_dir: PathBuf,
    /// Snapshot storage backend (default: sqlite)
    pub storage: StorageKind,
    /// Delay between a merged delta and the snapshot write (default: 500ms)
    pub persist_debounce: Duration,
    /// Base of the snapshot write retry backoff (default: 250ms)
    pub persist_retry_base: Duration,
    /// Attempts allowed for a final flush (default: 5)
    pub persist_max_flush_attempts: u32,
    /// Grace period before an empty room is evicted (default: 30s)
    pub room_idle_timeout: Duration,
    /// Server ping cadence (default: 15s)
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is dropped (default: 45s)
    pub heartbeat_timeout: Duration,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            data_dir: PathBuf::from("./tandem_data"),
            storage: StorageKind::Sqlite,
            persist_debounce: Duration::from_millis(500),
            persist_retry_base: Duration::from_millis(250),
            persist_max_flush_attempts: 5,
            room_idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:5174".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };
        let data_dir = lookup("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let storage = match lookup("STORAGE") {
            Some(raw) => raw.trim().parse()?,
            None => defaults.storage,
        };

        let millis = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            parse_var::<u64>(&lookup, var).map(|v| v.map_or(default, Duration::from_millis))
        };
        let secs = |var: &str, default: Duration| -> Result<Duration, ConfigError> {
            parse_var::<u64>(&lookup, var).map(|v| v.map_or(default, Duration::from_secs))
        };

        let persist_debounce = millis("PERSIST_DEBOUNCE_MS", defaults.persist_debounce)?;
        let persist_retry_base = millis("PERSIST_RETRY_BASE_MS", defaults.persist_retry_base)?;
        let persist_max_flush_attempts = parse_var::<u32>(&lookup, "PERSIST_MAX_FLUSH_ATTEMPTS")?
            .unwrap_or(defaults.persist_max_flush_attempts)
            .max(1);
        let room_idle_timeout = secs("ROOM_IDLE_TIMEOUT_SECS", defaults.room_idle_timeout)?;
        let heartbeat_interval = secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?;
        let heartbeat_timeout = secs("HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout)?;

        let cors_origins = match lookup("CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.cors_origins,
        };

        Ok(Config {
            host,
            port,
            data_dir,
            storage,
            persist_debounce,
            persist_retry_base,
            persist_max_flush_attempts,
            room_idle_timeout,
            heartbeat_interval,
            heartbeat_timeout,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Path of the SQLite snapshot database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("rooms.db")
    }

    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            persist_debounce: self.persist_debounce,
            persist: PersistSettings {
                retry_base: self.persist_retry_base,
                max_flush_attempts: self.persist_max_flush_attempts,
            },
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber {
                var: var.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT environment variable")]
    InvalidPort,
    #[error("Invalid {var} environment variable: {value:?}")]
    InvalidNumber { var: String, value: String },
    #[error("Invalid STORAGE environment variable: {0:?} (expected sqlite or memory)")]
    InvalidStorage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3030");
        assert_eq!(config.storage, StorageKind::Sqlite);
        assert_eq!(config.persist_debounce, Duration::from_millis(500));
        assert_eq!(config.room_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.database_path(), PathBuf::from("./tandem_data/rooms.db"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "4000"),
            ("STORAGE", "memory"),
            ("PERSIST_DEBOUNCE_MS", "50"),
            ("HEARTBEAT_TIMEOUT_SECS", "5"),
            ("CORS_ORIGINS", "https://a.example, ,https://b.example"),
        ]))
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.persist_debounce, Duration::from_millis(50));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(
            config.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("PORT", "http")])),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("STORAGE", "redis")])),
            Err(ConfigError::InvalidStorage(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("ROOM_IDLE_TIMEOUT_SECS", "-1")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
