#![forbid(unsafe_code)]

//! # query-harness
//!
//! Orchestrates query evaluations against a long-lived query server and keeps
//! a durable history of their results.
//!
//! An evaluation moves through compile, an optional database schema upgrade,
//! and run, all over one JSON-RPC connection shared by every in-flight
//! evaluation. Finished evaluations are recorded in an
//! [`EvaluationRecordStore`], persisted to a versioned JSON history file, and
//! their on-disk artifacts are eventually removed by the [`scrubber`].

pub mod config;
pub mod database;
pub mod evaluation;
pub mod history;
pub mod scrubber;
pub mod server;
pub mod state;
pub mod upgrade;

pub use config::{HarnessConfig, HistoryConfig, QueryServerConfig};
pub use database::{DatabaseMetadata, LocalDatabase};
pub use evaluation::{
    CompletedEvaluation, EvaluationCompleted, EvaluationError, EvaluationPhase, EvaluationRequest,
    OrchestratorConfig, QueryOrchestrator,
};
pub use history::{
    read_history, write_history, EvaluationRecord, EvaluationRecordStore, HistoryError, HistoryItem,
    RecordState,
};
pub use scrubber::{register_scrubber, ScrubReport, Scrubber, ScrubberConfig, ScrubberHandle};
pub use server::{CancellationContext, ProgressSink, QueryServer, QueryServerClient, ServerError};
pub use state::{GlobalState, MemoryGlobalState, SqliteGlobalState};
pub use upgrade::{DirectoryUpgradeCatalog, UpgradeCatalog, UpgradeError, UpgradeResolver};
