//! On-disk representation of the history file.
//!
//! The DTOs mirror the JSON layout exactly (camelCase keys, string paths) and
//! are kept separate from the domain types in [`super::record`]. Conversion
//! happens at the persistence boundary only.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{
    CompletedQuery, DatabaseInfo, EvalLogPaths, EvaluationRecord, HistoryItem, InitialQueryInfo,
    QueryEvaluationInfo, QueryMetadata, RecordState,
};
use super::variant_analysis::VariantAnalysisRecord;
use crate::server::{EvaluationResult, Position};

/// Version written by this crate.
pub const CURRENT_VERSION: i64 = 2;
/// Versions this crate can read.
pub const SUPPORTED_VERSIONS: &[i64] = &[1, 2];
/// Discriminator of retired remote-query items, silently dropped on load.
pub const RETIRED_REMOTE_TAG: &str = "remote";

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub version: i64,
    pub queries: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum HistoryItemDto {
    #[serde(rename = "local")]
    Local(LocalQueryDto),
    #[serde(rename = "variant-analysis")]
    VariantAnalysis(VariantAnalysisDto),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfoDto {
    pub name: String,
    pub database_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDirDto {
    pub query_save_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialQueryInfoDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_specified_label: Option<String>,
    #[serde(default)]
    pub query_text: String,
    #[serde(default)]
    pub is_quick_query: bool,
    #[serde(default)]
    pub is_quick_eval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_eval_position: Option<Position>,
    pub query_path: String,
    pub database_info: DatabaseInfoDto,
    pub start: DateTime<Utc>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<OutputDirDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEvaluationInfoDto {
    pub query_save_dir: String,
    pub db_item_path: String,
    #[serde(default)]
    pub database_has_metadata_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_eval_position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<QueryMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedQueryDto {
    pub query: QueryEvaluationInfoDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    /// Misspelled key written by older releases. Read, never written.
    #[serde(rename = "sucessful", default, skip_serializing)]
    pub legacy_successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_location: Option<String>,
    #[serde(default)]
    pub result_count: u64,
    #[serde(default)]
    pub sorted_results_info: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreted_results_sort_state: Option<Value>,
}

impl CompletedQueryDto {
    /// The correctly spelled key wins when both are present.
    pub fn is_successful(&self) -> bool {
        self.successful.or(self.legacy_successful).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueryDto {
    pub initial_info: InitialQueryInfoDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_query: Option<CompletedQueryDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_log_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_log_summary_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_eval_log_summary_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantAnalysisDto {
    pub status: RecordState,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_specified_label: Option<String>,
    pub variant_analysis: Value,
}

fn path_string(path: &std::path::Path) -> String {
    path.display().to_string()
}

impl From<&EvaluationRecord> for LocalQueryDto {
    fn from(record: &EvaluationRecord) -> Self {
        let initial = &record.initial;
        Self {
            initial_info: InitialQueryInfoDto {
                user_specified_label: initial.user_specified_label.clone(),
                query_text: initial.query_text.clone(),
                is_quick_query: initial.is_quick_query,
                is_quick_eval: initial.is_quick_eval,
                quick_eval_position: initial.quick_eval_position.clone(),
                query_path: path_string(&initial.query_path),
                database_info: DatabaseInfoDto {
                    name: initial.database_info.name.clone(),
                    database_uri: initial.database_info.database_uri.clone(),
                },
                start: initial.start,
                id: initial.id.clone(),
                output_dir: record.query_save_dir().map(|dir| OutputDirDto {
                    query_save_dir: path_string(dir),
                }),
            },
            failure_reason: record.failure_reason.clone(),
            completed_query: record.completed.as_ref().map(|c| CompletedQueryDto {
                query: QueryEvaluationInfoDto {
                    query_save_dir: path_string(&c.query.query_save_dir),
                    db_item_path: path_string(&c.query.db_item_path),
                    database_has_metadata_file: c.query.database_has_metadata_file,
                    quick_eval_position: c.query.quick_eval_position.clone(),
                    metadata: c.query.metadata.clone(),
                },
                result: c.result.clone(),
                message: c.message.clone(),
                successful: Some(c.successful),
                legacy_successful: None,
                log_file_location: c.log_file_location.as_deref().map(path_string),
                result_count: c.result_count,
                sorted_results_info: c.sorted_results_info.clone(),
                interpreted_results_sort_state: c.interpreted_results_sort_state.clone(),
            }),
            eval_log_location: record.eval_log.as_ref().map(|l| path_string(&l.log)),
            eval_log_summary_location: record
                .eval_log
                .as_ref()
                .and_then(|l| l.summary.as_deref())
                .map(path_string),
            json_eval_log_summary_location: record
                .eval_log
                .as_ref()
                .and_then(|l| l.json_summary.as_deref())
                .map(path_string),
        }
    }
}

impl From<LocalQueryDto> for EvaluationRecord {
    fn from(dto: LocalQueryDto) -> Self {
        let initial = dto.initial_info;
        let completed = dto.completed_query.map(|c| {
            let successful = c.is_successful();
            CompletedQuery {
                query: QueryEvaluationInfo {
                    query_save_dir: PathBuf::from(c.query.query_save_dir),
                    db_item_path: PathBuf::from(c.query.db_item_path),
                    database_has_metadata_file: c.query.database_has_metadata_file,
                    quick_eval_position: c.query.quick_eval_position,
                    metadata: c.query.metadata,
                },
                result: c.result,
                message: c.message,
                successful,
                log_file_location: c.log_file_location.map(PathBuf::from),
                result_count: c.result_count,
                sorted_results_info: c.sorted_results_info,
                interpreted_results_sort_state: c.interpreted_results_sort_state,
            }
        });
        // Older files only recorded the save dir on the completed query.
        let output_dir = initial
            .output_dir
            .map(|o| PathBuf::from(o.query_save_dir))
            .or_else(|| completed.as_ref().map(|c| c.query.query_save_dir.clone()));
        let eval_log = dto.eval_log_location.map(|log| EvalLogPaths {
            log: PathBuf::from(log),
            summary: dto.eval_log_summary_location.map(PathBuf::from),
            json_summary: dto.json_eval_log_summary_location.map(PathBuf::from),
        });
        Self {
            initial: InitialQueryInfo {
                id: initial.id,
                user_specified_label: initial.user_specified_label,
                query_text: initial.query_text,
                is_quick_query: initial.is_quick_query,
                is_quick_eval: initial.is_quick_eval,
                quick_eval_position: initial.quick_eval_position,
                query_path: PathBuf::from(initial.query_path),
                database_info: DatabaseInfo {
                    name: initial.database_info.name,
                    database_uri: initial.database_info.database_uri,
                },
                start: initial.start,
                output_dir,
            },
            failure_reason: dto.failure_reason,
            completed,
            eval_log,
        }
    }
}

impl From<&VariantAnalysisRecord> for VariantAnalysisDto {
    fn from(record: &VariantAnalysisRecord) -> Self {
        Self {
            status: record.status,
            completed: record.completed,
            failure_reason: record.failure_reason.clone(),
            result_count: record.result_count,
            user_specified_label: record.user_specified_label.clone(),
            variant_analysis: record.variant_analysis.clone(),
        }
    }
}

impl From<VariantAnalysisDto> for VariantAnalysisRecord {
    fn from(dto: VariantAnalysisDto) -> Self {
        Self {
            status: dto.status,
            completed: dto.completed,
            failure_reason: dto.failure_reason,
            result_count: dto.result_count,
            user_specified_label: dto.user_specified_label,
            variant_analysis: dto.variant_analysis,
        }
    }
}

impl From<&HistoryItem> for HistoryItemDto {
    fn from(item: &HistoryItem) -> Self {
        match item {
            HistoryItem::Local(record) => Self::Local(record.into()),
            HistoryItem::VariantAnalysis(record) => Self::VariantAnalysis(record.into()),
        }
    }
}

impl From<HistoryItemDto> for HistoryItem {
    fn from(dto: HistoryItemDto) -> Self {
        match dto {
            HistoryItemDto::Local(local) => Self::Local(local.into()),
            HistoryItemDto::VariantAnalysis(va) => Self::VariantAnalysis(va.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_json(completed: Value) -> Value {
        json!({
            "t": "local",
            "initialInfo": {
                "queryPath": "/w/a.ql",
                "databaseInfo": { "name": "db", "databaseUri": "file:///db" },
                "start": "2024-01-02T03:04:05Z",
                "id": "a-1"
            },
            "completedQuery": completed
        })
    }

    #[test]
    fn both_success_spellings_prefer_the_correct_one() {
        let value = local_json(json!({
            "query": { "querySaveDir": "/s/a-1", "dbItemPath": "/db" },
            "successful": false,
            "sucessful": true
        }));
        let dto: HistoryItemDto = serde_json::from_value(value).unwrap();
        let HistoryItem::Local(record) = HistoryItem::from(dto) else {
            panic!("expected local item");
        };
        assert!(!record.completed.unwrap().successful);
    }

    #[test]
    fn output_dir_is_migrated_from_completed_query() {
        let value = local_json(json!({
            "query": { "querySaveDir": "/s/a-1", "dbItemPath": "/db" },
            "sucessful": true
        }));
        let dto: HistoryItemDto = serde_json::from_value(value).unwrap();
        let HistoryItem::Local(record) = HistoryItem::from(dto) else {
            panic!("expected local item");
        };
        assert_eq!(record.initial.output_dir, Some(PathBuf::from("/s/a-1")));
        assert!(record.successful());
    }

    #[test]
    fn writes_only_the_correct_spelling() {
        let value = local_json(json!({
            "query": { "querySaveDir": "/s/a-1", "dbItemPath": "/db" },
            "sucessful": true
        }));
        let dto: HistoryItemDto = serde_json::from_value(value).unwrap();
        let record = HistoryItem::from(dto);
        let written = serde_json::to_value(HistoryItemDto::from(&record)).unwrap();
        assert_eq!(written["completedQuery"]["successful"], true);
        assert!(written["completedQuery"].get("sucessful").is_none());
        assert_eq!(written["t"], "local");
    }
}
