//! A request to evaluate one query against one database.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::database::DatabaseMetadata;
use crate::history::{DatabaseInfo, InitialQueryInfo};
use crate::server::Position;

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub id: String,
    pub query_path: PathBuf,
    pub query_text: String,
    /// Schema the query's library targets.
    pub query_schema: PathBuf,
    pub library_path: Vec<PathBuf>,
    pub quick_eval: Option<Position>,
    pub is_quick_query: bool,
    pub label: Option<String>,
    pub database: DatabaseInfo,
    pub start: DateTime<Utc>,
}

impl EvaluationRequest {
    pub fn new(
        query_path: impl Into<PathBuf>,
        query_schema: impl Into<PathBuf>,
        database: &dyn DatabaseMetadata,
    ) -> Self {
        let query_path = query_path.into();
        let database_path = database.database_path();
        let database_uri = if database_path.is_absolute() {
            format!("file://{}", database_path.display())
        } else {
            database_path.display().to_string()
        };
        let stem = query_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "query".to_string());
        Self {
            id: format!("{stem}-{}", uuid::Uuid::new_v4()),
            query_path,
            query_text: String::new(),
            query_schema: query_schema.into(),
            library_path: Vec::new(),
            quick_eval: None,
            is_quick_query: false,
            label: None,
            database: DatabaseInfo {
                name: database.name().to_string(),
                database_uri,
            },
            start: Utc::now(),
        }
    }

    pub fn with_quick_eval(mut self, position: Position) -> Self {
        self.quick_eval = Some(position);
        self
    }

    pub fn with_query_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = text.into();
        self
    }

    pub fn with_library_path(mut self, paths: Vec<PathBuf>) -> Self {
        self.library_path = paths;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn quick_query(mut self) -> Self {
        self.is_quick_query = true;
        self
    }

    pub fn is_quick_eval(&self) -> bool {
        self.quick_eval.is_some()
    }

    pub(crate) fn initial_info(&self, output_dir: PathBuf) -> InitialQueryInfo {
        InitialQueryInfo {
            id: self.id.clone(),
            user_specified_label: self.label.clone(),
            query_text: self.query_text.clone(),
            is_quick_query: self.is_quick_query,
            is_quick_eval: self.is_quick_eval(),
            quick_eval_position: self.quick_eval.clone(),
            query_path: self.query_path.clone(),
            database_info: self.database.clone(),
            start: self.start,
            output_dir: Some(output_dir),
        }
    }
}
