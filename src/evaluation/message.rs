//! User-facing text for evaluation outcomes.

use crate::server::{CompilationMessage, EvaluationResult, QueryResultType, Severity};

/// Status when compilation reported errors.
pub const COMPILATION_ERRORS_MESSAGE: &str = "Query had compilation errors";
/// Status when the evaluation was cancelled before a server result arrived.
pub const CANCELLED_MESSAGE: &str = "Query cancelled";
/// Appended to the surfaced text when full compile errors are in the log.
pub const COMPILATION_FAILED_TAIL: &str =
    " compilation failed. Please make sure there are no errors in the query, the database is up to date, and the query and database use the same target language. For more details on the error, go to View > Output, and choose CodeQL Query Server from the dropdown.";
/// Quick evaluations surface compile errors inline when there are at most this many.
pub const MAX_INLINE_QUICK_EVAL_ERRORS: usize = 2;

/// Summarizes a server result, e.g. `finished in 2 seconds`.
///
/// Durations are truncated to whole seconds.
pub fn format_result_message(result: &EvaluationResult) -> String {
    match result.result_type {
        QueryResultType::Cancellation => {
            format!("cancelled after {} seconds", result.evaluation_time / 1000)
        }
        QueryResultType::Oom => "out of memory".to_string(),
        QueryResultType::Success => {
            format!("finished in {} seconds", result.evaluation_time / 1000)
        }
        QueryResultType::Timeout => {
            format!("timed out after {} seconds", result.evaluation_time / 1000)
        }
        QueryResultType::OtherError | QueryResultType::Unknown(_) => match &result.message {
            Some(message) if !message.is_empty() => format!("failed: {message}"),
            _ => "failed".to_string(),
        },
    }
}

/// One-line form of a compiler diagnostic, including its location.
pub fn format_compilation_message(message: &CompilationMessage) -> String {
    let severity = match message.severity {
        Severity::Error => "ERROR".to_string(),
        Severity::Warning => "WARNING".to_string(),
        Severity::Unknown(code) => format!("SEVERITY {code}"),
    };
    format!("{severity}: {} ({})", message.message, message.position)
}

/// Text surfaced to the user for a failed compile. Small quick-eval failures
/// are shown in full; anything else points at the log.
pub fn surfaced_compile_failure(is_quick_eval: bool, errors: &[String]) -> String {
    if is_quick_eval && errors.len() <= MAX_INLINE_QUICK_EVAL_ERRORS {
        format!("Quick evaluation compilation failed: {}", errors.join("\n"))
    } else {
        let kind = if is_quick_eval { "Quick evaluation" } else { "Query" };
        format!("{kind}{COMPILATION_FAILED_TAIL}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Position;

    fn result(result_type: QueryResultType, millis: u64, message: Option<&str>) -> EvaluationResult {
        EvaluationResult {
            run_id: 1,
            query_id: 1,
            result_type,
            evaluation_time: millis,
            message: message.map(str::to_string),
            log_file_location: None,
        }
    }

    #[test]
    fn success_reports_whole_seconds() {
        let text = format_result_message(&result(QueryResultType::Success, 2_500, None));
        assert_eq!(text, "finished in 2 seconds");
    }

    #[test]
    fn each_result_type_has_its_own_wording() {
        assert_eq!(
            format_result_message(&result(QueryResultType::Cancellation, 1_999, None)),
            "cancelled after 1 seconds"
        );
        assert_eq!(format_result_message(&result(QueryResultType::Oom, 9_000, None)), "out of memory");
        assert_eq!(
            format_result_message(&result(QueryResultType::Timeout, 60_000, None)),
            "timed out after 60 seconds"
        );
        assert_eq!(
            format_result_message(&result(QueryResultType::OtherError, 0, Some("disk full"))),
            "failed: disk full"
        );
        assert_eq!(format_result_message(&result(QueryResultType::Unknown(17), 0, None)), "failed");
    }

    #[test]
    fn compile_messages_include_position() {
        let message = CompilationMessage {
            message: "could not resolve type Foo".into(),
            position: Position {
                file_name: "/w/q.ql".into(),
                line: 4,
                column: 3,
                end_line: 4,
                end_column: 5,
            },
            severity: Severity::Error,
        };
        assert_eq!(
            format_compilation_message(&message),
            "ERROR: could not resolve type Foo (/w/q.ql:4:3:4:5)"
        );
    }

    #[test]
    fn quick_eval_surfaces_few_errors_inline() {
        let errors = vec!["ERROR: a".to_string(), "ERROR: b".to_string()];
        assert_eq!(
            surfaced_compile_failure(true, &errors),
            "Quick evaluation compilation failed: ERROR: a\nERROR: b"
        );
        let many = vec!["x".to_string(); 3];
        assert!(surfaced_compile_failure(true, &many).starts_with("Quick evaluation compilation failed. Please"));
        assert!(surfaced_compile_failure(false, &errors).starts_with("Query compilation failed."));
    }
}
