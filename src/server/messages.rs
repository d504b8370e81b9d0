//! Wire types for the query server protocol.
//!
//! Result and severity codes are open integers on the wire: newer servers may
//! introduce codes this client has never seen. They are modelled as closed
//! enums with an `Unknown` arm so that an unrecognized code is carried through
//! (and treated as an error) instead of failing deserialization.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Method names
// =============================================================================

pub const COMPILE_QUERY: &str = "compilation/compileQuery";
pub const COMPILE_UPGRADE_SEQUENCE: &str = "compilation/compileUpgradeSequence";
pub const RUN_QUERIES: &str = "evaluation/runQueries";
pub const START_LOG: &str = "evaluation/startLog";
pub const END_LOG: &str = "evaluation/endLog";
pub const CLEAR_CACHE: &str = "evaluation/clearCache";
/// Server -> client request delivering the result of one evaluation run.
pub const QUERY_COMPLETED: &str = "evaluation/queryCompleted";
/// Server -> client notification carrying progress for a progress id.
pub const PROGRESS_UPDATED: &str = "semmle/progressUpdated";
pub const CANCEL_REQUEST: &str = "$/cancelRequest";

/// JSON-RPC error code the server uses for requests it abandoned after a
/// `$/cancelRequest`.
pub const REQUEST_CANCELLED_CODE: i64 = -32800;

/// A typed request: method name plus parameter and response shapes.
pub trait RequestKind {
    const METHOD: &'static str;
    type Params: Serialize + Send + Sync;
    type Response: DeserializeOwned + Send;
}

pub enum CompileQuery {}
pub enum CompileUpgradeSequence {}
pub enum RunQueries {}
pub enum StartLog {}
pub enum EndLog {}
pub enum ClearCache {}

impl RequestKind for CompileQuery {
    const METHOD: &'static str = COMPILE_QUERY;
    type Params = CompileQueryParams;
    type Response = CheckQueryResult;
}

impl RequestKind for CompileUpgradeSequence {
    const METHOD: &'static str = COMPILE_UPGRADE_SEQUENCE;
    type Params = CompileUpgradeSequenceParams;
    type Response = CompileUpgradeSequenceResult;
}

impl RequestKind for RunQueries {
    const METHOD: &'static str = RUN_QUERIES;
    type Params = EvaluateQueriesParams;
    type Response = serde_json::Value;
}

impl RequestKind for StartLog {
    const METHOD: &'static str = START_LOG;
    type Params = LogParams;
    type Response = LogResult;
}

impl RequestKind for EndLog {
    const METHOD: &'static str = END_LOG;
    type Params = LogParams;
    type Response = LogResult;
}

impl RequestKind for ClearCache {
    const METHOD: &'static str = CLEAR_CACHE;
    type Params = ClearCacheParams;
    type Response = ClearCacheResult;
}

/// Every request body travels wrapped together with the id that progress
/// notifications for it will carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithProgressId<T> {
    pub body: T,
    pub progress_id: u64,
}

// =============================================================================
// Shared types
// =============================================================================

/// A span inside a source file. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub file_name: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.file_name, self.line, self.column, self.end_line, self.end_column
        )
    }
}

impl FromStr for Position {
    type Err = String;

    /// Parses `file:line:column:endLine:endColumn`. The file part may itself
    /// contain colons (Windows drive letters), so numbers are taken from the right.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(5, ':');
        let mut next_number = |what: &str| -> Result<u32, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {what} in position '{s}'"))?
                .parse::<u32>()
                .map_err(|_| format!("invalid {what} in position '{s}'"))
        };
        let end_column = next_number("end column")?;
        let end_line = next_number("end line")?;
        let column = next_number("column")?;
        let line = next_number("line")?;
        let file_name = parts
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| format!("missing file name in position '{s}'"))?;
        Ok(Self {
            file_name: file_name.to_string(),
            line,
            column,
            end_line,
            end_column,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub db_dir: String,
    pub working_set: String,
}

impl Dataset {
    pub fn new(db_dir: impl Into<String>) -> Self {
        Self {
            db_dir: db_dir.into(),
            working_set: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub id: u64,
    pub step: u32,
    pub max_step: u32,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Open-ended codes
// =============================================================================

/// Any JSON integer. Codes past the `i64` range saturate and fractional
/// codes truncate, so they still land in an `Unknown` arm.
#[derive(Debug, Clone, Copy)]
struct WireCode(i64);

impl<'de> Deserialize<'de> for WireCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CodeVisitor;

        impl<'de> serde::de::Visitor<'de> for CodeVisitor {
            type Value = WireCode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer code")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<WireCode, E> {
                Ok(WireCode(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<WireCode, E> {
                Ok(WireCode(i64::try_from(v).unwrap_or(i64::MAX)))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<WireCode, E> {
                Ok(WireCode(v as i64))
            }
        }

        deserializer.deserialize_any(CodeVisitor)
    }
}

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireCode", into = "i64")]
pub enum Severity {
    Error,
    Warning,
    Unknown(i64),
}

impl Severity {
    /// Unrecognized severities block the pipeline the same way errors do.
    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Unknown(_))
    }
}

impl From<i64> for Severity {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::Error,
            1 => Self::Warning,
            other => Self::Unknown(other),
        }
    }
}

impl From<WireCode> for Severity {
    fn from(code: WireCode) -> Self {
        Self::from(code.0)
    }
}

impl From<Severity> for i64 {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Error => 0,
            Severity::Warning => 1,
            Severity::Unknown(code) => code,
        }
    }
}

/// Outcome class of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireCode", into = "i64")]
pub enum QueryResultType {
    Success,
    OtherError,
    Oom,
    Timeout,
    Cancellation,
    Unknown(i64),
}

impl QueryResultType {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Collapses unknown codes into `OtherError`.
    pub fn normalized(self) -> Self {
        match self {
            Self::Unknown(_) => Self::OtherError,
            other => other,
        }
    }
}

impl From<i64> for QueryResultType {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::OtherError,
            2 => Self::Oom,
            3 => Self::Timeout,
            4 => Self::Cancellation,
            other => Self::Unknown(other),
        }
    }
}

impl From<WireCode> for QueryResultType {
    fn from(code: WireCode) -> Self {
        Self::from(code.0)
    }
}

impl From<QueryResultType> for i64 {
    fn from(result_type: QueryResultType) -> Self {
        match result_type {
            QueryResultType::Success => 0,
            QueryResultType::OtherError => 1,
            QueryResultType::Oom => 2,
            QueryResultType::Timeout => 3,
            QueryResultType::Cancellation => 4,
            QueryResultType::Unknown(code) => code,
        }
    }
}

// =============================================================================
// Compilation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationOptions {
    pub compute_no_location_urls: bool,
    pub fail_on_warnings: bool,
    pub fast_compilation: bool,
    pub include_dil_in_qlo: bool,
    pub local_checking: bool,
    pub no_compute_get_url: bool,
    pub no_compute_to_string: bool,
    pub compute_default_strings: bool,
    pub emit_debug_info: bool,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            compute_no_location_urls: true,
            fail_on_warnings: false,
            fast_compilation: false,
            include_dil_in_qlo: true,
            local_checking: false,
            no_compute_get_url: false,
            no_compute_to_string: false,
            compute_default_strings: true,
            emit_debug_info: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraOptions {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QlProgram {
    pub library_path: Vec<String>,
    pub dbscheme_path: String,
    pub query_path: String,
}

/// Whole-file compilation or quick evaluation of a sub-span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompilationTarget {
    Query {},
    QuickEval {
        #[serde(rename = "quickEvalPos")]
        quick_eval_pos: Position,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileQueryParams {
    pub compilation_options: CompilationOptions,
    pub extra_options: ExtraOptions,
    pub query_to_check: QlProgram,
    pub result_path: String,
    pub target: CompilationTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationMessage {
    #[serde(default)]
    pub message: String,
    pub position: Position,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckQueryResult {
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub messages: Vec<CompilationMessage>,
    #[serde(default)]
    pub result_patterns: Vec<serde_json::Value>,
}

impl CheckQueryResult {
    pub fn errors(&self) -> impl Iterator<Item = &CompilationMessage> {
        self.messages.iter().filter(|m| m.severity.is_error())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileUpgradeSequenceParams {
    pub upgrade_temp_dir: String,
    pub upgrade_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileUpgradeSequenceResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_upgrade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Evaluation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogParams {
    pub db: Dataset,
    pub log_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResult {
    #[serde(default)]
    pub outcome_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryToRun {
    pub id: u64,
    pub qlo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_upgrade: Option<String>,
    pub results_path: String,
    pub timeout_secs: u64,
    pub allow_unknown_templates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateQueriesParams {
    pub db: Dataset,
    pub evaluate_id: u64,
    pub queries: Vec<QueryToRun>,
    pub stop_on_error: bool,
    pub use_sequence_hint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheParams {
    pub dry_run: bool,
    pub db: Dataset,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheResult {
    #[serde(default)]
    pub deletion_message: String,
}

/// Result of a single evaluation as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    #[serde(default)]
    pub run_id: u64,
    #[serde(default)]
    pub query_id: i64,
    pub result_type: QueryResultType,
    /// Wall clock milliseconds.
    #[serde(deserialize_with = "deserialize_millis")]
    pub evaluation_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_location: Option<String>,
}

impl EvaluationResult {
    /// A result the client fabricates when the pipeline stops before the
    /// server produced one.
    pub fn synthetic(result_type: QueryResultType, message: impl Into<String>) -> Self {
        Self {
            run_id: 0,
            query_id: 0,
            result_type,
            evaluation_time: 0,
            message: Some(message.into()),
            log_file_location: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_type.is_success()
    }
}

/// Servers report times as JSON numbers which may carry a fraction.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Ok(0);
    }
    Ok(value.round() as u64)
}
