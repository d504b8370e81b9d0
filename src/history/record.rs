//! Domain model for query history entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evaluation::message::format_result_message;
use crate::server::{EvaluationResult, Position};

use super::variant_analysis::VariantAnalysisRecord;

/// Lifecycle state shared by every kind of history item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    InProgress,
    Completed,
    Failed,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub database_uri: String,
}

/// Rule metadata parsed from the query file's header, when available.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// What was known when the evaluation was started.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialQueryInfo {
    pub id: String,
    pub user_specified_label: Option<String>,
    pub query_text: String,
    pub is_quick_query: bool,
    pub is_quick_eval: bool,
    pub quick_eval_position: Option<Position>,
    pub query_path: PathBuf,
    pub database_info: DatabaseInfo,
    pub start: DateTime<Utc>,
    /// Where this evaluation's artifacts are written.
    pub output_dir: Option<PathBuf>,
}

/// Server-side facts about a finished evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvaluationInfo {
    pub query_save_dir: PathBuf,
    pub db_item_path: PathBuf,
    pub database_has_metadata_file: bool,
    pub quick_eval_position: Option<Position>,
    pub metadata: Option<QueryMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedQuery {
    pub query: QueryEvaluationInfo,
    pub result: Option<EvaluationResult>,
    pub message: Option<String>,
    pub successful: bool,
    pub log_file_location: Option<PathBuf>,
    pub result_count: u64,
    pub sorted_results_info: BTreeMap<String, serde_json::Value>,
    pub interpreted_results_sort_state: Option<serde_json::Value>,
}

impl CompletedQuery {
    /// Text shown for the outcome of the run.
    pub fn status_message(&self) -> String {
        match (&self.message, &self.result) {
            (Some(message), _) if !message.is_empty() => message.clone(),
            (_, Some(result)) => format_result_message(result),
            _ if self.successful => "finished".to_string(),
            _ => "failed".to_string(),
        }
    }
}

/// Structured evaluator log artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalLogPaths {
    pub log: PathBuf,
    pub summary: Option<PathBuf>,
    pub json_summary: Option<PathBuf>,
}

/// One local evaluation, from start to terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub initial: InitialQueryInfo,
    pub failure_reason: Option<String>,
    pub completed: Option<CompletedQuery>,
    pub eval_log: Option<EvalLogPaths>,
}

impl EvaluationRecord {
    pub fn new(initial: InitialQueryInfo) -> Self {
        Self {
            initial,
            failure_reason: None,
            completed: None,
            eval_log: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.initial.id
    }

    /// `Failed` when a failure reason is set or the run was unsuccessful,
    /// `InProgress` until a completion is attached, `Completed` otherwise.
    pub fn state(&self) -> RecordState {
        if self.failure_reason.is_some() {
            return RecordState::Failed;
        }
        match &self.completed {
            None => RecordState::InProgress,
            Some(completed) if completed.successful => RecordState::Completed,
            Some(_) => RecordState::Failed,
        }
    }

    pub fn successful(&self) -> bool {
        self.state() == RecordState::Completed
    }

    pub fn display_status(&self) -> String {
        if let Some(reason) = &self.failure_reason {
            return reason.clone();
        }
        match &self.completed {
            Some(completed) => completed.status_message(),
            None => "in progress".to_string(),
        }
    }

    /// The user's label, or `<query file> on <database> - <status>`.
    pub fn label(&self) -> String {
        if let Some(label) = &self.initial.user_specified_label {
            return label.clone();
        }
        let query_name = self
            .initial
            .query_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.initial.query_path.display().to_string());
        format!(
            "{} on {} - {}",
            query_name,
            self.initial.database_info.name,
            self.display_status()
        )
    }

    /// Directory holding this record's artifacts.
    pub fn query_save_dir(&self) -> Option<&Path> {
        self.completed
            .as_ref()
            .map(|c| c.query.query_save_dir.as_path())
            .or(self.initial.output_dir.as_deref())
    }

    pub fn result_count(&self) -> Option<u64> {
        self.completed.as_ref().map(|c| c.result_count)
    }
}

/// Anything that can appear in the history.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryItem {
    Local(EvaluationRecord),
    VariantAnalysis(VariantAnalysisRecord),
}

impl HistoryItem {
    pub fn id(&self) -> String {
        match self {
            Self::Local(record) => record.id().to_string(),
            Self::VariantAnalysis(record) => record.id(),
        }
    }

    pub fn state(&self) -> RecordState {
        match self {
            Self::Local(record) => record.state(),
            Self::VariantAnalysis(record) => record.status,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Local(record) => record.label(),
            Self::VariantAnalysis(record) => record.label(),
        }
    }

    pub fn as_local(&self) -> Option<&EvaluationRecord> {
        match self {
            Self::Local(record) => Some(record),
            Self::VariantAnalysis(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::QueryResultType;

    fn record() -> EvaluationRecord {
        EvaluationRecord::new(InitialQueryInfo {
            id: "q1".into(),
            user_specified_label: None,
            query_text: String::new(),
            is_quick_query: false,
            is_quick_eval: false,
            quick_eval_position: None,
            query_path: PathBuf::from("/w/find-bugs.ql"),
            database_info: DatabaseInfo {
                name: "java-db".into(),
                database_uri: "file:///dbs/java-db".into(),
            },
            start: Utc::now(),
            output_dir: None,
        })
    }

    fn completed(result_type: QueryResultType) -> CompletedQuery {
        CompletedQuery {
            query: QueryEvaluationInfo {
                query_save_dir: PathBuf::from("/s/q1"),
                db_item_path: PathBuf::from("/dbs/java-db"),
                database_has_metadata_file: true,
                quick_eval_position: None,
                metadata: None,
            },
            result: Some(EvaluationResult::synthetic(result_type, "")),
            message: None,
            successful: result_type.is_success(),
            log_file_location: None,
            result_count: 0,
            sorted_results_info: BTreeMap::new(),
            interpreted_results_sort_state: None,
        }
    }

    #[test]
    fn state_follows_failure_then_completion() {
        let mut r = record();
        assert_eq!(r.state(), RecordState::InProgress);
        r.completed = Some(completed(QueryResultType::Success));
        assert_eq!(r.state(), RecordState::Completed);
        r.failure_reason = Some("boom".into());
        assert_eq!(r.state(), RecordState::Failed);
        assert_eq!(r.display_status(), "boom");
    }

    #[test]
    fn unsuccessful_completion_is_failed() {
        let mut r = record();
        r.completed = Some(completed(QueryResultType::Unknown(99)));
        assert_eq!(r.state(), RecordState::Failed);
        assert!(!r.successful());
    }

    #[test]
    fn default_label_names_query_database_and_status() {
        let r = record();
        assert_eq!(r.label(), "find-bugs.ql on java-db - in progress");
        let mut labelled = r.clone();
        labelled.initial.user_specified_label = Some("mine".into());
        assert_eq!(labelled.label(), "mine");
    }
}
