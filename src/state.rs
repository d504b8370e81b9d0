//! Small key/value store shared by every process using the same storage
//! directory. The scrubber keeps its last-run time here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait GlobalState: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StateError>;
}

/// SQLite-backed global state.
#[derive(Clone)]
pub struct SqliteGlobalState {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGlobalState {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             CREATE TABLE IF NOT EXISTS global_state (\
               key TEXT PRIMARY KEY,\
               value TEXT NOT NULL,\
               updated_at INTEGER NOT NULL\
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StateError>
    where
        F: FnOnce(&Connection) -> Result<R, StateError>,
    {
        let guard = self.conn.lock().map_err(|_| StateError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl GlobalState for SqliteGlobalState {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        let key = key.to_string();
        let state = self.clone();
        tokio::task::spawn_blocking(move || {
            state.with_conn(|conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT value FROM global_state WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                raw.map(|raw| serde_json::from_str(&raw).map_err(StateError::from))
                    .transpose()
            })
        })
        .await
        .map_err(|e| StateError::Join(e.to_string()))?
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        let key = key.to_string();
        let raw = serde_json::to_string(&value)?;
        let state = self.clone();
        tokio::task::spawn_blocking(move || {
            state.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO global_state (key, value, updated_at) VALUES (?1, ?2, ?3)\
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, raw, now_epoch()],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StateError::Join(e.to_string()))?
    }
}

/// Process-local state, for tests and one-shot tools.
#[derive(Default)]
pub struct MemoryGlobalState {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryGlobalState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GlobalState for MemoryGlobalState {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StateError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
