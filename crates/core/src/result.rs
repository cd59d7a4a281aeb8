//! The per-job result model.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// One intercepted database operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Executed statement text with literal values inlined.
    pub sql: String,
    /// Statement with literals generalized to placeholders, for grouping.
    pub template: String,
    /// Execution duration in milliseconds.
    pub time: f64,
    /// 1-based line in the transaction source that issued the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    /// The trimmed text of `line_number`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
}

/// Everything one job reports back.
///
/// Built once per job, filled in by each orchestrator phase and serialized
/// by [`serialize_result`](crate::serializer::serialize_result). Partial
/// state survives failures: a populated `error` never clears the rest.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub output: String,
    pub queries: Vec<QueryRecord>,
    pub erd: String,
    pub returned: Option<Value>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    /// Set only when the schema could not be applied by any provisioning path.
    pub schema_error: Option<String>,
}

impl ExecutionResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. The first failure wins; later ones are appended to
    /// the traceback so nothing is lost.
    pub fn record_error(&mut self, message: impl Into<String>, traceback: Option<String>) {
        let message = message.into();
        if self.error.is_none() {
            self.error = Some(message);
            self.traceback = traceback;
            return;
        }
        let extra = match traceback {
            Some(tb) => format!("{message}\n{tb}"),
            None => message,
        };
        self.traceback = Some(match self.traceback.take() {
            Some(existing) => format!("{existing}\n{extra}"),
            None => extra,
        });
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_record_omits_unresolved_line() {
        let record = QueryRecord {
            sql: "SELECT 1".into(),
            template: "SELECT ?".into(),
            time: 0.5,
            line_number: None,
            source_context: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("line_number").is_none());
        assert!(json.get("source_context").is_none());
        assert_eq!(json["time"], 0.5);
    }

    #[test]
    fn first_error_wins() {
        let mut result = ExecutionResult::new();
        result.record_error("boom", Some("at run (transaction.rhai:3)".into()));
        result.record_error("close failed", None);

        assert_eq!(result.error.as_deref(), Some("boom"));
        let tb = result.traceback.unwrap();
        assert!(tb.starts_with("at run"));
        assert!(tb.ends_with("close failed"));
    }

    #[test]
    fn fresh_result_is_success() {
        let result = ExecutionResult::new();
        assert!(result.is_success());
        assert!(result.queries.is_empty());
        assert_eq!(result.erd, "");
    }
}
