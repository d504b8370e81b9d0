//! Query server protocol: wire types, transport, and the [`QueryServer`] seam
//! the orchestrator talks through.

pub mod cancel;
pub mod client;
pub mod codec;
pub mod error;
pub mod messages;

use std::sync::Arc;

pub use cancel::{CancellationContext, NoopProgress, ProgressSink, TracingProgress};
pub use client::{CompletionRegistration, QueryServerClient, RpcConnection, NO_RESULT_MESSAGE};
pub use error::ServerError;
pub use messages::*;

/// Everything needed to evaluate one compiled query.
#[derive(Debug, Clone)]
pub struct RunQuery {
    pub db: Dataset,
    pub compiled_query: String,
    pub compiled_upgrade: Option<String>,
    pub results_path: String,
    /// Textual log the server should be told about; echoed into the result.
    pub log_path: Option<String>,
}

/// Operations the evaluation pipeline needs from a query server.
#[async_trait::async_trait]
pub trait QueryServer: Send + Sync {
    async fn compile_query(
        &self,
        params: CompileQueryParams,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<CheckQueryResult, ServerError>;

    async fn compile_upgrade_sequence(
        &self,
        params: CompileUpgradeSequenceParams,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<CompileUpgradeSequenceResult, ServerError>;

    /// Runs one query and waits for its completion callback.
    async fn run_query(
        &self,
        run: RunQuery,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<EvaluationResult, ServerError>;

    /// Starts structured evaluator logging. Not cancellable.
    async fn start_log(&self, params: LogParams) -> Result<LogResult, ServerError>;

    /// Ends structured evaluator logging. Not cancellable.
    async fn end_log(&self, params: LogParams) -> Result<LogResult, ServerError>;

    fn supports_per_query_eval_log(&self) -> bool;

    fn query_timeout_secs(&self) -> u64;
}
