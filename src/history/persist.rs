//! Reading and writing the history file.

use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::dto::{HistoryDocument, HistoryItemDto, CURRENT_VERSION, RETIRED_REMOTE_TAG, SUPPORTED_VERSIONS};
use super::record::{HistoryItem, RecordState};
use super::HistoryError;

/// Exclusive advisory lock on `<history file>.lock`, held for the duration
/// of a write so concurrent writers in other processes serialize.
#[derive(Debug)]
pub struct HistoryLock {
    _file: std::fs::File,
}

impl HistoryLock {
    pub fn acquire(history_path: &Path) -> Result<Self, HistoryError> {
        let mut lock_path = history_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| HistoryError::Io {
                path: lock_path.clone(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| HistoryError::Io {
            path: lock_path,
            source,
        })?;
        Ok(Self { _file: file })
    }
}

/// Writes every terminal item to `path`, replacing the file atomically.
/// In-progress local evaluations are not persisted.
pub async fn write_history(items: &[HistoryItem], path: &Path) -> Result<(), HistoryError> {
    let queries = items
        .iter()
        .filter(|item| match item {
            HistoryItem::Local(record) => record.state() != RecordState::InProgress,
            HistoryItem::VariantAnalysis(_) => true,
        })
        .map(|item| serde_json::to_value(HistoryItemDto::from(item)))
        .collect::<Result<Vec<Value>, _>>()?;
    let document = HistoryDocument {
        version: CURRENT_VERSION,
        queries,
    };
    let mut body = serde_json::to_vec_pretty(&document)?;
    body.push(b'\n');

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomically(&path, &body))
        .await
        .map_err(|e| HistoryError::Join(e.to_string()))?
}

fn write_atomically(path: &Path, body: &[u8]) -> Result<(), HistoryError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io = |source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(&parent).map_err(io)?;
    let _lock = HistoryLock::acquire(path)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(io)?;
    tmp.write_all(body).map_err(io)?;
    tmp.as_file().sync_all().map_err(io)?;
    tmp.persist(path).map_err(|e| io(e.error))?;
    debug!(path = %path.display(), bytes = body.len(), "history written");
    Ok(())
}

/// Loads history from `path`.
///
/// A missing file yields an empty history. An unreadable, malformed, or
/// unsupported-version file is deleted and also yields an empty history:
/// history is a convenience and must never block startup. Local items whose
/// artifact directory has disappeared are dropped.
pub async fn read_history(path: &Path) -> Vec<HistoryItem> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(path = %path.display(), "no history file");
            return Vec::new();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot check history file");
            return Vec::new();
        }
    }

    let items = match parse_history_file(path).await {
        Ok(items) => items,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "discarding unreadable query history");
            if let Err(err) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %err, "failed to delete corrupt history file");
            }
            return Vec::new();
        }
    };
    retain_existing(items).await
}

async fn parse_history_file(path: &Path) -> Result<Vec<HistoryItem>, HistoryError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_history(&text)
}

/// Parses the text of a history file.
pub fn parse_history(text: &str) -> Result<Vec<HistoryItem>, HistoryError> {
    let document: HistoryDocument = serde_json::from_str(text)?;
    if !SUPPORTED_VERSIONS.contains(&document.version) {
        return Err(HistoryError::UnsupportedVersion(document.version));
    }
    let mut items = Vec::with_capacity(document.queries.len());
    for query in document.queries {
        if query.get("t").and_then(Value::as_str) == Some(RETIRED_REMOTE_TAG) {
            continue;
        }
        let dto: HistoryItemDto = serde_json::from_value(query)?;
        items.push(HistoryItem::from(dto));
    }
    Ok(items)
}

async fn retain_existing(items: Vec<HistoryItem>) -> Vec<HistoryItem> {
    let checks = items.into_iter().map(|item| async move {
        let keep = match &item {
            HistoryItem::Local(record) => match &record.completed {
                Some(completed) => tokio::fs::try_exists(&completed.query.query_save_dir)
                    .await
                    .unwrap_or(false),
                None => true,
            },
            HistoryItem::VariantAnalysis(_) => true,
        };
        keep.then_some(item)
    });
    futures::future::join_all(checks)
        .await
        .into_iter()
        .flatten()
        .collect()
}
