//! User-code runner.
//!
//! [`ScriptRunner::run`] compiles a transaction script into a fresh engine,
//! looks up the entry point by name and calls it on a blocking thread.
//! Output goes to the injected sink and queries to the connection's bus,
//! both owned by the caller, so whatever was captured before a failure
//! survives it.

pub mod convert;
pub mod engine;
pub mod orm;
pub mod traceback;

use std::any::Any;
use std::sync::Arc;

use querylens_core::output::OutputSink;
use querylens_core::value::Value;
use rhai::{Dynamic, Scope};

pub use orm::DbHandle;

/// A loaded transaction script.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    /// Source identity; query attribution matches stack frames against it.
    pub id: String,
    pub text: String,
}

impl ScriptSource {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub entry_point: String,
    /// 0 means unlimited.
    pub max_operations: u64,
    pub max_call_levels: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            entry_point: "run".to_string(),
            max_operations: 0,
            max_call_levels: 64,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub returned: Option<Value>,
}

/// A failure in user code, with the function-call chain that led to it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RunError {
    pub message: String,
    pub traceback: Option<String>,
}

impl RunError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }
}

/// Scope constant the entry point's database argument is passed through.
const DB_VARIABLE: &str = "querylens_db";

pub struct ScriptRunner {
    options: RunnerOptions,
}

impl ScriptRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    pub async fn run(
        &self,
        script: ScriptSource,
        db: DbHandle,
        sink: Arc<dyn OutputSink>,
    ) -> Result<RunOutcome, RunError> {
        let options = self.options.clone();
        let task = tokio::task::spawn_blocking(move || execute(&options, &script, db, sink));
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(%message, "Script thread panicked");
                Err(RunError::new(format!("Script runner panicked: {message}")))
            }
            Err(e) => Err(RunError::new(format!("Script runner was cancelled: {e}"))),
        }
    }
}

fn execute(
    options: &RunnerOptions,
    script: &ScriptSource,
    db: DbHandle,
    sink: Arc<dyn OutputSink>,
) -> Result<RunOutcome, RunError> {
    let mut engine = engine::build(options, sink);
    orm::register(&mut engine, db.clone());

    let mut ast = engine
        .compile(&script.text)
        .map_err(|e| traceback::from_parse_error(script, &e))?;
    ast.set_source(script.id.as_str());

    let arity = ast
        .iter_functions()
        .find(|f| f.name == options.entry_point)
        .map(|f| f.params.len());
    let Some(arity) = arity else {
        tracing::info!(entry_point = %options.entry_point, "No entry point defined, nothing to run");
        return Ok(RunOutcome::default());
    };

    let mut scope = Scope::new();
    let entry = options.entry_point.as_str();
    let call = match arity {
        0 => format!("{entry}()"),
        1 => {
            scope.push_constant(DB_VARIABLE, db);
            format!("{entry}({DB_VARIABLE})")
        }
        n => {
            return Err(RunError::new(format!(
                "Entry point '{entry}' must take zero or one parameter, found {n}"
            )))
        }
    };
    let call = engine
        .compile(&call)
        .map_err(|e| RunError::new(format!("Cannot call entry point '{entry}': {e}")))?;

    // The call is appended to the script and evaluated as one program so
    // the source identity stays on the runtime state for native calls.
    let mut program = ast.merge(&call);
    program.set_source(script.id.as_str());
    let result = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &program);

    match result {
        Ok(value) => Ok(RunOutcome {
            returned: normalize_return(&value),
        }),
        Err(e) => Err(traceback::from_eval_error(script, &e)),
    }
}

/// Strings pass through, maps and arrays become structured values, unit
/// means nothing was returned and anything else is stringified.
fn normalize_return(value: &Dynamic) -> Option<Value> {
    if value.is_unit() {
        None
    } else if value.is_map() || value.is_array() {
        Some(convert::to_value(value))
    } else {
        Some(Value::String(convert::display(value)))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use querylens_core::output::BufferSink;
    use querylens_db::Connection;
    use querylens_events::QueryBus;
    use tokio::runtime::Handle;

    use querylens_core::attribution::QueryLogger;

    use super::*;

    const SCRIPT_WITH_QUERIES: &str = "fn lap(db) {\n    // helper\n    db.query(\"SELECT 1\");\n}\nfn run(db) {\n    lap(db);\n    db.query(\"SELECT 2\");\n}\n";

    async fn handle() -> DbHandle {
        let conn = Connection::open("sqlite::memory:", Arc::new(QueryBus::default()))
            .await
            .unwrap();
        DbHandle::new(conn, None, Handle::current())
    }

    async fn run(text: &str) -> (Result<RunOutcome, RunError>, String) {
        let sink = Arc::new(BufferSink::new());
        let outcome = ScriptRunner::new(RunnerOptions::default())
            .run(
                ScriptSource::new("transaction.rhai", text),
                handle().await,
                sink.clone(),
            )
            .await;
        (outcome, sink.contents())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_entry_point_runs_nothing() {
        let (outcome, output) = run(r#"print("top level");"#).await;
        assert!(outcome.unwrap().returned.is_none());
        assert_eq!(output, "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entry_point_may_omit_the_handle() {
        let (outcome, output) = run(r#"fn run() { print("hello"); }"#).await;
        assert!(outcome.unwrap().returned.is_none());
        assert_eq!(output, "hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn returns_are_normalized() {
        let (outcome, _) = run(r#"fn run(db) { "Lewis" }"#).await;
        assert_eq!(outcome.unwrap().returned.unwrap().as_str(), Some("Lewis"));

        let (outcome, _) = run("fn run() { 44 }").await;
        assert_eq!(outcome.unwrap().returned.unwrap().as_str(), Some("44"));

        let (outcome, _) = run("fn run() { #{ wins: 103 } }").await;
        assert!(matches!(outcome.unwrap().returned, Some(Value::Object(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entry_point_with_two_parameters_is_rejected() {
        let (outcome, _) = run("fn run(a, b) {}").await;
        assert!(outcome.unwrap_err().message.contains("zero or one parameter"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn thrown_error_keeps_earlier_output() {
        let (outcome, output) = run(
            "fn run(db) {\n    print(\"one\");\n    print(\"two\");\n    throw \"Boom\";\n}\n",
        )
        .await;
        let err = outcome.unwrap_err();
        assert_eq!(err.message, "Boom");
        assert_eq!(output, "one\ntwo");
        let traceback = err.traceback.unwrap();
        assert!(traceback.contains("line 4, in run"), "{traceback}");
        assert!(traceback.contains("throw \"Boom\";"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn syntax_error_is_reported() {
        let (outcome, _) = run("fn run( {").await;
        let err = outcome.unwrap_err();
        assert!(err.message.starts_with("Syntax error"));
        assert!(err.traceback.unwrap().contains("transaction.rhai"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queries_carry_the_script_source_and_line() {
        let bus = Arc::new(QueryBus::default());
        let conn = Connection::open("sqlite::memory:", bus.clone()).await.unwrap();
        let logger = Arc::new(QueryLogger::new("laps.rhai", SCRIPT_WITH_QUERIES));
        let other = Arc::new(QueryLogger::new("transaction.rhai", SCRIPT_WITH_QUERIES));
        bus.subscribe(logger.clone());
        bus.subscribe(other.clone());

        ScriptRunner::new(RunnerOptions::default())
            .run(
                ScriptSource::new("laps.rhai", SCRIPT_WITH_QUERIES),
                DbHandle::new(conn, None, Handle::current()),
                Arc::new(BufferSink::new()),
            )
            .await
            .unwrap();

        let records = logger.take();
        let lines: Vec<Option<usize>> = records.iter().map(|r| r.line_number).collect();
        assert_eq!(lines, vec![Some(3), Some(7)]);
        assert_eq!(records[1].source_context.as_deref(), Some("db.query(\"SELECT 2\");"));

        // A logger keyed on another identity never matches.
        assert!(other.take().iter().all(|r| r.line_number.is_none()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn custom_entry_point_name() {
        let sink = Arc::new(BufferSink::new());
        let options = RunnerOptions {
            entry_point: "main".into(),
            ..RunnerOptions::default()
        };
        ScriptRunner::new(options)
            .run(
                ScriptSource::new("t.rhai", r#"fn run() { print("no"); } fn main() { print("yes"); }"#),
                handle().await,
                sink.clone(),
            )
            .await
            .unwrap();
        assert_eq!(sink.contents(), "yes");
    }
}
