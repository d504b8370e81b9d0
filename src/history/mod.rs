//! Query history: records of past and running evaluations, and their
//! persisted form.

pub mod dto;
pub mod persist;
pub mod record;
pub mod store;
pub mod variant_analysis;

use std::path::PathBuf;

use thiserror::Error;

pub use persist::{parse_history, read_history, write_history, HistoryLock};
pub use record::{
    CompletedQuery, DatabaseInfo, EvalLogPaths, EvaluationRecord, HistoryItem, InitialQueryInfo,
    QueryEvaluationInfo, QueryMetadata, RecordState,
};
pub use store::EvaluationRecordStore;
pub use variant_analysis::VariantAnalysisRecord;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("unknown history item {0}")]
    UnknownRecord(String),
    #[error("evaluation {0} has already finished")]
    AlreadyTerminal(String),
    #[error("evaluation {0} is still running")]
    StillRunning(String),
    #[error("evaluation {0} has no completed result")]
    NotCompleted(String),
    #[error("unsupported query history format: v{0}")]
    UnsupportedVersion(i64),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
}
