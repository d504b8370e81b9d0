//! Periodic deletion of expired evaluation output directories.
//!
//! Every output directory carries a `timestamp` file with its creation time in
//! epoch milliseconds. A background task wakes on a fixed interval; at most
//! one pass runs per throttle window across every process sharing the same
//! global state, because the last-run time is recorded there before any
//! deletion starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HistoryConfig;
use crate::evaluation::output::now_epoch_ms;
use crate::evaluation::TIMESTAMP_FILE;
use crate::history::EvaluationRecordStore;
use crate::state::{GlobalState, StateError};

/// Global state key holding the last pass time in epoch milliseconds.
pub const LAST_SCRUB_TIME_KEY: &str = "lastScrubTime";

#[derive(Debug, Error)]
pub enum ScrubError {
    #[error("global state error: {0}")]
    State(#[from] StateError),
}

#[derive(Debug, Clone)]
pub struct ScrubberConfig {
    pub wake_interval: Duration,
    pub throttle: Duration,
    pub max_query_age: Duration,
    pub roots: Vec<PathBuf>,
}

impl ScrubberConfig {
    pub fn from_history(config: &HistoryConfig) -> Self {
        Self {
            wake_interval: config.scrub_wake_interval,
            throttle: config.scrub_throttle,
            max_query_age: config.max_query_age,
            roots: config.scrub_roots(),
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubReport {
    pub deleted: usize,
    pub kept: usize,
    pub errors: Vec<String>,
}

type RunObserver = Arc<dyn Fn(&ScrubReport) + Send + Sync>;

pub struct Scrubber {
    config: ScrubberConfig,
    state: Arc<dyn GlobalState>,
    records: Option<Arc<EvaluationRecordStore>>,
    observer: Option<RunObserver>,
}

impl Scrubber {
    pub fn new(config: ScrubberConfig, state: Arc<dyn GlobalState>) -> Self {
        Self {
            config,
            state,
            records: None,
            observer: None,
        }
    }

    /// Prunes history items whose directories were deleted after each pass.
    pub fn with_records(mut self, records: Arc<EvaluationRecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Called after every pass that actually ran.
    pub fn with_observer(mut self, observer: impl Fn(&ScrubReport) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Runs a pass unless one ran within the throttle window.
    pub async fn tick(&self) -> Result<Option<ScrubReport>, ScrubError> {
        self.tick_at(now_epoch_ms()).await
    }

    pub async fn tick_at(&self, now_ms: i64) -> Result<Option<ScrubReport>, ScrubError> {
        let last = self
            .state
            .get(LAST_SCRUB_TIME_KEY)
            .await?
            .and_then(|v| v.as_i64());
        let throttle_ms = i64::try_from(self.config.throttle.as_millis()).unwrap_or(i64::MAX);
        if let Some(last) = last {
            if now_ms.saturating_sub(last) < throttle_ms {
                debug!(last, now_ms, "scrub throttled");
                return Ok(None);
            }
        }
        self.scrub_now_at(now_ms).await.map(Some)
    }

    /// Runs a pass regardless of the throttle and records it as the last run.
    pub async fn scrub_now(&self) -> Result<ScrubReport, ScrubError> {
        self.scrub_now_at(now_epoch_ms()).await
    }

    pub async fn scrub_now_at(&self, now_ms: i64) -> Result<ScrubReport, ScrubError> {
        self.state.set(LAST_SCRUB_TIME_KEY, json!(now_ms)).await?;

        let report = self.scrub_at(now_ms).await;
        if let Some(records) = &self.records {
            records.remove_deleted_queries().await;
        }
        if let Some(observer) = &self.observer {
            observer(&report);
        }
        Ok(report)
    }

    /// One unthrottled pass over every root.
    pub async fn scrub_at(&self, now_ms: i64) -> ScrubReport {
        let max_age_ms = i64::try_from(self.config.max_query_age.as_millis()).unwrap_or(i64::MAX);
        let mut report = ScrubReport::default();
        for root in &self.config.roots {
            scrub_root(root, now_ms, max_age_ms, &mut report).await;
        }
        if report.errors.is_empty() {
            info!(deleted = report.deleted, kept = report.kept, "scrubbed query directories");
        } else {
            warn!(
                deleted = report.deleted,
                kept = report.kept,
                "errors while scrubbing query directories:\n{}",
                report.errors.join("\n")
            );
        }
        report
    }
}

async fn scrub_root(root: &Path, now_ms: i64, max_age_ms: i64, report: &mut ScrubReport) {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) => {
            debug!(root = %root.display(), error = %err, "skipping scrub root");
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                report.errors.push(format!("Could not read '{}': {err}", root.display()));
                break;
            }
        };
        let path = entry.path();
        match scrub_entry(&path, now_ms, max_age_ms).await {
            Ok(true) => report.deleted += 1,
            Ok(false) => report.kept += 1,
            Err(err) => report.errors.push(format!("Could not delete '{}': {err}", path.display())),
        }
    }
}

/// Deletes `path` if it is not an output directory or has expired.
/// Returns whether it was deleted.
async fn scrub_entry(path: &Path, now_ms: i64, max_age_ms: i64) -> std::io::Result<bool> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if !metadata.is_dir() {
        debug!(path = %path.display(), "deleting stray file");
        tokio::fs::remove_file(path).await?;
        return Ok(true);
    }
    if !is_expired(path, now_ms, max_age_ms).await {
        return Ok(false);
    }
    debug!(path = %path.display(), "deleting expired query directory");
    tokio::fs::remove_dir_all(path).await?;
    Ok(true)
}

/// A directory is expired when its age exceeds `max_age_ms`, or when its
/// timestamp is missing or not an integer.
async fn is_expired(dir: &Path, now_ms: i64, max_age_ms: i64) -> bool {
    let raw = match tokio::fs::read_to_string(dir.join(TIMESTAMP_FILE)).await {
        Ok(raw) => raw,
        Err(_) => return true,
    };
    match raw.trim().parse::<i64>() {
        Ok(created) => now_ms.saturating_sub(created) > max_age_ms,
        Err(_) => true,
    }
}

/// Handle to the background scrub task. Dropping it stops the task.
pub struct ScrubberHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ScrubberHandle {
    /// Stops the task and waits for an in-flight pass to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ScrubberHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts the background scrub loop. The first pass is attempted one wake
/// interval after registration.
pub fn register_scrubber(scrubber: Scrubber) -> ScrubberHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let wake = scrubber.config.wake_interval;
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + wake, wake);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = scrubber.tick().await {
                        warn!(error = %err, "scrub pass failed");
                    }
                }
            }
        }
        debug!("scrubber stopped");
    });
    ScrubberHandle {
        cancel,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expiry_boundary_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TIMESTAMP_FILE), "1000").unwrap();
        assert!(!is_expired(dir.path(), 1_500, 500).await);
        assert!(is_expired(dir.path(), 1_501, 500).await);
    }

    #[tokio::test]
    async fn unreadable_markers_expire() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_expired(dir.path(), 0, i64::MAX).await);
        std::fs::write(dir.path().join(TIMESTAMP_FILE), "12abc").unwrap();
        assert!(is_expired(dir.path(), 0, i64::MAX).await);
    }
}
