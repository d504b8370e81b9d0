//! Per-evaluation output directory layout.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;

/// File holding the creation time, in epoch milliseconds, that the scrubber
/// uses to judge a directory's age.
pub const TIMESTAMP_FILE: &str = "timestamp";

/// Paths of every artifact one evaluation may produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutputDir {
    root: PathBuf,
}

impl QueryOutputDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for evaluation `id` under `queries_dir`.
    pub fn for_query(queries_dir: &Path, id: &str) -> Self {
        Self::new(queries_dir.join(id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timestamp_path(&self) -> PathBuf {
        self.root.join(TIMESTAMP_FILE)
    }

    pub fn compiled_query_path(&self) -> PathBuf {
        self.root.join("compiledQuery.qlo")
    }

    pub fn results_path(&self) -> PathBuf {
        self.root.join("results.bqrs")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("query.log")
    }

    pub fn eval_log_path(&self) -> PathBuf {
        self.root.join("evaluator-log.jsonl")
    }

    pub fn eval_log_summary_path(&self) -> PathBuf {
        self.root.join("evaluator-log.summary")
    }

    pub fn json_eval_log_summary_path(&self) -> PathBuf {
        self.root.join("evaluator-log.summary.jsonl")
    }

    /// Where interpreted results go for a query of the given `@kind`. Graph
    /// queries produce a directory of results rather than one SARIF file.
    pub fn interpreted_results_path(&self, kind: Option<&str>) -> PathBuf {
        match kind {
            Some("graph") => self.root.join("graphResults"),
            _ => self.root.join("interpretedResults.sarif"),
        }
    }

    /// Creates the directory and stamps it with `now_ms`.
    pub async fn create(&self, now_ms: i64) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.timestamp_path(), now_ms.to_string()).await
    }

    pub async fn has_eval_log(&self) -> bool {
        tokio::fs::try_exists(self.eval_log_path()).await.unwrap_or(false)
    }
}

/// Append-only textual log for one evaluation.
#[derive(Debug, Clone)]
pub struct QueryLog {
    path: PathBuf,
}

impl QueryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line. Failures are logged and otherwise ignored.
    pub async fn line(&self, text: impl AsRef<str>) {
        if let Err(err) = self.try_line(text.as_ref()).await {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to write query log");
        }
    }

    async fn try_line(&self, text: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_writes_timestamp_and_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let out = QueryOutputDir::for_query(dir.path(), "q-1");
        out.create(1_234).await.unwrap();
        assert_eq!(std::fs::read_to_string(out.timestamp_path()).unwrap(), "1234");
        assert!(!out.has_eval_log().await);

        let log = QueryLog::new(out.log_path());
        log.line("first").await;
        log.line("second").await;
        assert_eq!(std::fs::read_to_string(out.log_path()).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn graph_queries_get_a_results_directory() {
        let out = QueryOutputDir::new("/q");
        assert_eq!(out.interpreted_results_path(Some("graph")), Path::new("/q/graphResults"));
        assert_eq!(
            out.interpreted_results_path(Some("problem")),
            Path::new("/q/interpretedResults.sarif")
        );
        assert_eq!(out.interpreted_results_path(None), Path::new("/q/interpretedResults.sarif"));
    }
}
