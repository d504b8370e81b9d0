//! Drives one evaluation through compile, upgrade, and run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use super::message::{
    format_compilation_message, format_result_message, surfaced_compile_failure, CANCELLED_MESSAGE,
    COMPILATION_ERRORS_MESSAGE,
};
use super::output::{now_epoch_ms, QueryLog, QueryOutputDir};
use super::request::EvaluationRequest;
use super::EvaluationError;
use crate::database::DatabaseMetadata;
use crate::history::{CompletedQuery, EvalLogPaths, EvaluationRecord, EvaluationRecordStore, QueryEvaluationInfo};
use crate::server::{
    CancellationContext, CompilationOptions, CompilationTarget, CompileQueryParams, Dataset,
    EvaluationResult, ExtraOptions, LogParams, ProgressSink, QlProgram, QueryResultType, QueryServer,
    RunQuery,
};
use crate::upgrade::{UpgradeDescriptor, UpgradeError, UpgradeResolver};

const EVENT_CAPACITY: usize = 64;

/// Where an evaluation is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationPhase {
    Created,
    Compiling,
    Upgrading,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl EvaluationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    fn for_result(result_type: QueryResultType) -> Self {
        match result_type {
            QueryResultType::Success => Self::Succeeded,
            QueryResultType::Cancellation => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// Broadcast once per evaluation when it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct EvaluationCompleted {
    pub record: EvaluationRecord,
    pub phase: EvaluationPhase,
}

/// Terminal result of [`QueryOrchestrator::evaluate`].
#[derive(Debug, Clone)]
pub struct CompletedEvaluation {
    pub record: EvaluationRecord,
    pub phase: EvaluationPhase,
    /// Message to show the user, when it differs from the record's status.
    pub surfaced_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parent of every per-evaluation output directory.
    pub queries_dir: PathBuf,
}

struct PipelineOutcome {
    result: EvaluationResult,
    status: String,
    surfaced: Option<String>,
    eval_log: Option<EvalLogPaths>,
}

impl PipelineOutcome {
    fn from_result(result: EvaluationResult, eval_log: Option<EvalLogPaths>) -> Self {
        Self {
            status: format_result_message(&result),
            result,
            surfaced: None,
            eval_log,
        }
    }

    fn cancelled() -> Self {
        Self {
            result: EvaluationResult::synthetic(QueryResultType::Cancellation, CANCELLED_MESSAGE),
            status: CANCELLED_MESSAGE.to_string(),
            surfaced: None,
            eval_log: None,
        }
    }

    fn compile_failed(surfaced: String) -> Self {
        Self {
            result: EvaluationResult::synthetic(QueryResultType::OtherError, COMPILATION_ERRORS_MESSAGE),
            status: COMPILATION_ERRORS_MESSAGE.to_string(),
            surfaced: Some(surfaced),
            eval_log: None,
        }
    }

    fn phase(&self) -> EvaluationPhase {
        EvaluationPhase::for_result(self.result.result_type)
    }
}

/// Evaluates queries, one pipeline per request, many concurrently.
///
/// Each evaluation's state lives in the shared [`EvaluationRecordStore`]. A
/// failure in one evaluation is recorded against that evaluation only.
pub struct QueryOrchestrator {
    server: Arc<dyn QueryServer>,
    resolver: UpgradeResolver,
    records: Arc<EvaluationRecordStore>,
    phases: Mutex<HashMap<String, EvaluationPhase>>,
    events: broadcast::Sender<EvaluationCompleted>,
    config: OrchestratorConfig,
}

impl QueryOrchestrator {
    pub fn new(
        server: Arc<dyn QueryServer>,
        resolver: UpgradeResolver,
        records: Arc<EvaluationRecordStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            server,
            resolver,
            records,
            phases: Mutex::new(HashMap::new()),
            events,
            config,
        }
    }

    pub fn records(&self) -> &Arc<EvaluationRecordStore> {
        &self.records
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EvaluationCompleted> {
        self.events.subscribe()
    }

    /// Requests cancellation of a running evaluation. A no-op once it has
    /// finished.
    pub fn cancel(&self, id: &str) -> bool {
        self.records.cancel(id)
    }

    /// Current phase of a running evaluation.
    pub fn phase(&self, id: &str) -> Option<EvaluationPhase> {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    fn set_phase(&self, id: &str, phase: EvaluationPhase) {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        if phase.is_terminal() {
            phases.remove(id);
        } else {
            phases.insert(id.to_string(), phase);
        }
        debug!(id, ?phase, "evaluation phase");
    }

    pub async fn evaluate(
        &self,
        request: EvaluationRequest,
        database: &dyn DatabaseMetadata,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<CompletedEvaluation, EvaluationError> {
        let output = QueryOutputDir::for_query(&self.config.queries_dir, &request.id);
        let (_, cancel) = self
            .records
            .create(request.initial_info(output.root().to_path_buf()));
        self.set_phase(&request.id, EvaluationPhase::Created);

        let span = info_span!(
            "evaluation",
            id = %request.id,
            query = %request.query_path.display(),
            database = database.name()
        );
        async {
            info!("evaluation started");
            match self.run_pipeline(&request, database, &output, &cancel, progress).await {
                Ok(outcome) => self.finish(&request, database, &output, outcome),
                Err(err) => {
                    warn!(error = %err, "evaluation failed");
                    self.set_phase(&request.id, EvaluationPhase::Failed);
                    match self.records.fail(&request.id, err.to_string()) {
                        Ok(record) => self.publish(record, EvaluationPhase::Failed),
                        Err(record_err) => warn!(error = %record_err, "could not record failure"),
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn finish(
        &self,
        request: &EvaluationRequest,
        database: &dyn DatabaseMetadata,
        output: &QueryOutputDir,
        outcome: PipelineOutcome,
    ) -> Result<CompletedEvaluation, EvaluationError> {
        let phase = outcome.phase();
        let log_file_location = outcome
            .result
            .log_file_location
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| Some(output.log_path()));
        let completed = CompletedQuery {
            query: QueryEvaluationInfo {
                query_save_dir: output.root().to_path_buf(),
                db_item_path: database.database_path().to_path_buf(),
                database_has_metadata_file: database.has_metadata_file(),
                quick_eval_position: request.quick_eval.clone(),
                metadata: None,
            },
            successful: outcome.result.is_success(),
            result: Some(outcome.result),
            message: Some(outcome.status),
            log_file_location,
            result_count: 0,
            sorted_results_info: BTreeMap::new(),
            interpreted_results_sort_state: None,
        };
        self.set_phase(&request.id, phase);
        let record = self.records.complete(&request.id, completed, outcome.eval_log)?;
        info!(?phase, status = %record.display_status(), "evaluation finished");
        self.publish(record.clone(), phase);
        Ok(CompletedEvaluation {
            record,
            phase,
            surfaced_message: outcome.surfaced,
        })
    }

    fn publish(&self, record: EvaluationRecord, phase: EvaluationPhase) {
        // No subscribers is fine.
        let _ = self.events.send(EvaluationCompleted { record, phase });
    }

    async fn run_pipeline(
        &self,
        request: &EvaluationRequest,
        database: &dyn DatabaseMetadata,
        output: &QueryOutputDir,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<PipelineOutcome, EvaluationError> {
        let database_schema = database
            .schema_path()
            .ok_or_else(|| EvaluationError::MissingDatabaseScheme {
                database: database.name().to_string(),
            })?;
        check_same_language(request, database, database_schema)?;

        output
            .create(now_epoch_ms())
            .await
            .map_err(|source| EvaluationError::Io {
                path: output.root().to_path_buf(),
                source,
            })?;
        let log = QueryLog::new(output.log_path());

        self.set_phase(&request.id, EvaluationPhase::Compiling);
        let mut upgrade = self
            .resolver
            .resolve(database_schema, &request.query_schema)
            .await?;
        let outcome = self
            .compile_and_run(request, database, output, &log, &mut upgrade, cancel, progress)
            .await;
        upgrade.release();
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn compile_and_run(
        &self,
        request: &EvaluationRequest,
        database: &dyn DatabaseMetadata,
        output: &QueryOutputDir,
        log: &QueryLog,
        upgrade: &mut UpgradeDescriptor,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<PipelineOutcome, EvaluationError> {
        let params = CompileQueryParams {
            compilation_options: CompilationOptions::default(),
            extra_options: ExtraOptions {
                timeout_secs: self.server.query_timeout_secs(),
            },
            query_to_check: QlProgram {
                library_path: request
                    .library_path
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
                dbscheme_path: upgrade.target_schema().display().to_string(),
                query_path: request.query_path.display().to_string(),
            },
            result_path: output.compiled_query_path().display().to_string(),
            target: match &request.quick_eval {
                Some(position) => CompilationTarget::QuickEval {
                    quick_eval_pos: position.clone(),
                },
                None => CompilationTarget::Query {},
            },
        };

        let check = match self.server.compile_query(params, cancel, progress.clone()).await {
            Ok(check) => check,
            Err(err) if err.is_cancellation() => return Ok(PipelineOutcome::cancelled()),
            Err(err) => return Err(err.into()),
        };
        log.line(if check.from_cache {
            "Compilation done (cached)"
        } else {
            "Compilation done"
        })
        .await;

        let errors: Vec<String> = check.errors().map(format_compilation_message).collect();
        if !errors.is_empty() {
            for error in &errors {
                log.line(error).await;
            }
            warn!(errors = errors.len(), "query failed to compile");
            let surfaced = surfaced_compile_failure(request.is_quick_eval(), &errors);
            return Ok(PipelineOutcome::compile_failed(surfaced));
        }

        if upgrade.needs_upgrade() {
            self.set_phase(&request.id, EvaluationPhase::Upgrading);
            log.line(format!("Compiling {} database upgrade(s)", upgrade.scripts.len()))
                .await;
            match self
                .resolver
                .compile(self.server.as_ref(), upgrade, cancel, progress.clone())
                .await
            {
                Ok(()) => {}
                Err(UpgradeError::Server(err)) if err.is_cancellation() => {
                    return Ok(PipelineOutcome::cancelled())
                }
                Err(err) => return Err(err.into()),
            }
        }

        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::cancelled());
        }

        self.set_phase(&request.id, EvaluationPhase::Running);
        let dataset = Dataset::new(database.dataset_path().display().to_string());
        let log_params = LogParams {
            db: dataset.clone(),
            log_path: output.eval_log_path().display().to_string(),
        };
        let structured_log = self.server.supports_per_query_eval_log();
        if structured_log {
            self.server.start_log(log_params.clone()).await?;
        }

        let run = self
            .server
            .run_query(
                RunQuery {
                    db: dataset,
                    compiled_query: output.compiled_query_path().display().to_string(),
                    compiled_upgrade: upgrade.compiled_upgrade().map(|p| p.display().to_string()),
                    results_path: output.results_path().display().to_string(),
                    log_path: Some(output.log_path().display().to_string()),
                },
                cancel,
                progress,
            )
            .await;

        // Runs whatever the run's outcome.
        let eval_log = if structured_log {
            self.finish_eval_log(log_params, output, log).await
        } else {
            None
        };

        let result = match run {
            Ok(result) => result,
            Err(err) if err.is_cancellation() => return Ok(PipelineOutcome::cancelled()),
            Err(err) => return Err(err.into()),
        };
        if !result.is_success() {
            let message = result.message.as_deref().unwrap_or("Failed to run query");
            log.line(message).await;
            warn!(result_type = ?result.result_type, "{message}");
        }
        log.line(format!("Evaluation {}", format_result_message(&result)))
            .await;
        Ok(PipelineOutcome::from_result(result, eval_log))
    }

    async fn finish_eval_log(
        &self,
        params: LogParams,
        output: &QueryOutputDir,
        log: &QueryLog,
    ) -> Option<EvalLogPaths> {
        if let Err(err) = self.server.end_log(params).await {
            warn!(error = %err, "endLog failed");
        }
        if !output.has_eval_log().await {
            let text = format!(
                "Failed to write structured evaluator log to {}.",
                output.eval_log_path().display()
            );
            log.line(&text).await;
            warn!("{text}");
            return None;
        }
        let summary = existing(output.eval_log_summary_path()).await;
        let json_summary = existing(output.json_eval_log_summary_path()).await;
        Some(EvalLogPaths {
            log: output.eval_log_path(),
            summary,
            json_summary,
        })
    }
}

async fn existing(path: PathBuf) -> Option<PathBuf> {
    tokio::fs::try_exists(&path)
        .await
        .unwrap_or(false)
        .then_some(path)
}

/// A database and a query match when their schema files share a name;
/// upgrades never rename the schema.
fn check_same_language(
    request: &EvaluationRequest,
    database: &dyn DatabaseMetadata,
    database_schema: &Path,
) -> Result<(), EvaluationError> {
    if database_schema.file_name() == request.query_schema.file_name() {
        return Ok(());
    }
    Err(EvaluationError::LanguageMismatch {
        query: request.query_path.display().to_string(),
        database: database.name().to_string(),
    })
}

