//! Variant analysis entries.
//!
//! These runs are managed elsewhere. History only needs their status and
//! label; the analysis itself is carried as an opaque JSON document so that
//! fields this crate does not know about survive a load/save cycle.

use serde_json::Value;

use super::record::RecordState;

#[derive(Debug, Clone, PartialEq)]
pub struct VariantAnalysisRecord {
    pub status: RecordState,
    pub completed: bool,
    pub failure_reason: Option<String>,
    pub result_count: Option<u64>,
    pub user_specified_label: Option<String>,
    pub variant_analysis: Value,
}

impl VariantAnalysisRecord {
    /// The analysis id, as text.
    pub fn id(&self) -> String {
        match self.variant_analysis.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => String::new(),
        }
    }

    pub fn query_name(&self) -> Option<&str> {
        self.variant_analysis
            .get("query")
            .and_then(|q| q.get("name"))
            .and_then(Value::as_str)
    }

    pub fn label(&self) -> String {
        if let Some(label) = &self.user_specified_label {
            return label.clone();
        }
        let name = self.query_name().unwrap_or("variant analysis");
        match self.result_count {
            Some(count) => format!("{name} ({count} results)"),
            None => name.to_string(),
        }
    }
}
