//! Query evaluation: requests, output layout, and the pipeline that runs them.

pub mod message;
pub mod output;
pub mod request;
pub mod runner;

use std::path::PathBuf;

use thiserror::Error;

use crate::history::HistoryError;
use crate::server::ServerError;
use crate::upgrade::UpgradeError;

pub use message::format_result_message;
pub use output::{QueryLog, QueryOutputDir, TIMESTAMP_FILE};
pub use request::EvaluationRequest;
pub use runner::{
    CompletedEvaluation, EvaluationCompleted, EvaluationPhase, OrchestratorConfig, QueryOrchestrator,
};

/// Errors that abort a single evaluation.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Database {database} does not have a database scheme.")]
    MissingDatabaseScheme { database: String },

    #[error(
        "The query {query} cannot be run against the selected database ({database}): their target languages are different. Please select a different database and try again."
    )]
    LanguageMismatch { query: String, database: String },

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error("query server error: {0}")]
    Server(#[from] ServerError),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    History(#[from] HistoryError),
}
