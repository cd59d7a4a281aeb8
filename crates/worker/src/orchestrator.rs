//! Job orchestration.
//!
//! One [`JobOrchestrator`] drives one job through
//! `Provisioning -> Executing -> Reporting`, ending in `Done` or, when the
//! result carries an error (user code threw or the database was
//! unreachable), in `Faulted`. Every phase writes into the same
//! [`ExecutionResult`], so a failure late in the job never discards what
//! earlier phases produced. Without a connection the script still runs and
//! its database calls raise the connection error.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use querylens_core::attribution::QueryLogger;
use querylens_core::erd;
use querylens_core::output::BufferSink;
use querylens_core::result::ExecutionResult;
use querylens_core::schema::Schema;
use querylens_db::provision::{ProvisionOptions, Provisioner};
use querylens_db::Connection;
use querylens_events::{QueryBus, QueryTrace};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::runner::{DbHandle, ScriptRunner, ScriptSource};

/// Source identity used when the transaction path has no file name.
const DEFAULT_SOURCE_ID: &str = "transaction.rhai";

/// How long to wait for the query trace to drain after the job.
const TRACE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// The two inputs of a job.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub schema_source: String,
    pub script: ScriptSource,
}

impl JobInput {
    pub fn new(schema_source: impl Into<String>, script: ScriptSource) -> Self {
        Self {
            schema_source: schema_source.into(),
            script,
        }
    }

    /// Read the schema and transaction files named by `config`.
    pub fn load(config: &HarnessConfig) -> HarnessResult<Self> {
        let schema_source = read(&config.schema_path)?;
        let text = read(&config.transaction_path)?;
        let id = config
            .transaction_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_SOURCE_ID.to_string());
        Ok(Self::new(schema_source, ScriptSource::new(id, text)))
    }
}

fn read(path: &Path) -> HarnessResult<String> {
    std::fs::read_to_string(path).map_err(|source| HarnessError::Input {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Provisioning,
    Executing,
    Reporting,
    Done,
    Faulted,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Executing => "executing",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

pub struct JobOrchestrator {
    job_id: Uuid,
    phase: JobPhase,
    config: HarnessConfig,
}

impl JobOrchestrator {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            phase: JobPhase::Pending,
            config: config.clone(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    fn transition(&mut self, next: JobPhase) {
        tracing::info!(job_id = %self.job_id, from = %self.phase, to = %next, "Job phase changed");
        self.phase = next;
    }

    fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            database_url: self.config.database_url.clone(),
            schema_path: Some(self.config.schema_path.clone()).filter(|path| path.is_file()),
            migrate_command: self.config.migrate_command.clone(),
            timeout: self.config.migrate_timeout,
        }
    }

    /// Run the job to completion. Never fails: every problem ends up in the
    /// returned result.
    pub async fn run(&mut self, input: JobInput) -> ExecutionResult {
        let mut result = ExecutionResult::new();
        let bus = Arc::new(QueryBus::default());
        let trace = tokio::spawn(QueryTrace::run(bus.tap()));
        let schema = Schema::parse(&input.schema_source).ok();

        self.transition(JobPhase::Provisioning);
        let (conn, db) = match Connection::open(&self.config.database_url, Arc::clone(&bus)).await {
            Ok(conn) => {
                self.provision(&conn, &input.schema_source, &mut result).await;
                let db = DbHandle::new(conn.clone(), schema, Handle::current());
                (Some(conn), db)
            }
            Err(e) => {
                tracing::error!(
                    job_id = %self.job_id,
                    url = %querylens_db::redact(&self.config.database_url),
                    error = %e,
                    "Database connection failed"
                );
                let message = format!("Database connection failed: {e}");
                result.record_error(message.clone(), None);
                result.erd = erd::synthesize(&input.schema_source);
                (None, DbHandle::unavailable(message, schema, Handle::current()))
            }
        };

        self.transition(JobPhase::Executing);
        let logger = Arc::new(QueryLogger::new(
            input.script.id.clone(),
            input.script.text.clone(),
        ));
        let sink = Arc::new(BufferSink::new());
        let subscription = bus.subscribe(logger.clone());

        let outcome = ScriptRunner::new(self.config.runner.clone())
            .run(input.script, db, sink.clone())
            .await;

        self.transition(JobPhase::Reporting);
        bus.unsubscribe(subscription);
        match outcome {
            Ok(outcome) => result.returned = outcome.returned,
            Err(e) => {
                tracing::info!(job_id = %self.job_id, error = %e.message, "User code failed");
                result.record_error(e.message, e.traceback);
            }
        }
        result.output = sink.contents();
        result.queries = logger.take();

        if let Some(conn) = conn {
            conn.close().await;
        }
        drop(bus);
        match tokio::time::timeout(TRACE_DRAIN_TIMEOUT, trace).await {
            Ok(Ok(traced)) => tracing::debug!(job_id = %self.job_id, traced, "Query trace drained"),
            _ => tracing::debug!(job_id = %self.job_id, "Query trace did not drain in time"),
        }

        if result.is_success() {
            self.transition(JobPhase::Done);
        } else {
            self.transition(JobPhase::Faulted);
        }
        result
    }

    /// Bring the database to the schema while the ERD is drawn.
    async fn provision(&self, conn: &Connection, schema_source: &str, result: &mut ExecutionResult) {
        let options = self.provision_options();
        let provisioner = Provisioner::new(conn, &options);
        let erd_source = schema_source.to_string();
        let (report, diagram) = tokio::join!(
            provisioner.provision(schema_source),
            tokio::task::spawn_blocking(move || erd::synthesize(&erd_source)),
        );
        result.erd = diagram.unwrap_or_else(|e| {
            tracing::warn!(job_id = %self.job_id, error = %e, "ERD synthesis did not complete");
            String::new()
        });
        if let Some(message) = report.schema_error() {
            result.schema_error = Some(message.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SCHEMA: &str = r#"
model Driver {
  id   Int    @id @default(autoincrement())
  name String
}
"#;

    fn config(vars: &[(&str, &str)]) -> HarnessConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HarnessConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    fn input(script: &str) -> JobInput {
        JobInput::new(SCHEMA, ScriptSource::new("transaction.rhai", script))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_job_ends_done() {
        let mut job = JobOrchestrator::new(&config(&[]));
        assert_eq!(job.phase(), JobPhase::Pending);

        let result = job
            .run(input(r#"fn run(db) { db.create("Driver", #{ name: "Lewis" }); "ok" }"#))
            .await;

        assert_eq!(job.phase(), JobPhase::Done);
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.queries.len(), 1);
        assert!(result.erd.starts_with("pako:"));
        assert!(result.schema_error.is_none());
        assert_eq!(result.returned.as_ref().and_then(|v| v.as_str()), Some("ok"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connection_failure_faults_but_keeps_erd() {
        let mut job = JobOrchestrator::new(&config(&[("DATABASE_URL", "mysql://nowhere/db")]));
        let result = job.run(input(r#"fn run() { print("before"); }"#)).await;

        assert_eq!(job.phase(), JobPhase::Faulted);
        assert!(result.error.unwrap().starts_with("Database connection failed"));
        assert!(result.erd.starts_with("pako:"));
        assert!(result.queries.is_empty());
        assert_eq!(result.output, "before");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn database_calls_without_connection_raise() {
        let mut job = JobOrchestrator::new(&config(&[("DATABASE_URL", "mysql://nowhere/db")]));
        let result = job
            .run(input(r#"fn run(db) { print("a"); db.query("SELECT 1"); print("b"); }"#))
            .await;

        assert_eq!(job.phase(), JobPhase::Faulted);
        assert!(result.error.unwrap().starts_with("Database connection failed"));
        let traceback = result.traceback.unwrap();
        assert!(traceback.contains("Database connection failed"), "{traceback}");
        assert_eq!(result.output, "a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn thrown_error_faults_after_reporting() {
        let mut job = JobOrchestrator::new(&config(&[]));
        let result = job
            .run(input(r#"fn run(db) { db.create("Driver", #{ name: "Max" }); print("x"); throw "stop"; }"#))
            .await;

        assert_eq!(job.phase(), JobPhase::Faulted);
        assert!(result.error.as_deref().unwrap().contains("stop"));
        assert_eq!(result.output, "x");
        assert_eq!(result.queries.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn provisioning_queries_are_not_reported() {
        let mut job = JobOrchestrator::new(&config(&[]));
        let result = job.run(input("fn run() { print(\"hi\"); }")).await;

        assert!(result.queries.is_empty());
        assert_eq!(result.output, "hi");
    }

    #[test]
    fn load_reads_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("schema.prisma");
        let script_path = dir.path().join("job.rhai");
        std::fs::write(&schema_path, SCHEMA).unwrap();
        std::fs::write(&script_path, "fn run() {}").unwrap();

        let config = config(&[
            ("HARNESS_SCHEMA_PATH", schema_path.to_str().unwrap()),
            ("HARNESS_TRANSACTION_PATH", script_path.to_str().unwrap()),
        ]);
        let input = JobInput::load(&config).unwrap();
        assert_eq!(input.script.id, "job.rhai");
        assert_eq!(input.schema_source, SCHEMA);
    }

    #[test]
    fn load_reports_missing_file() {
        let config = config(&[("HARNESS_SCHEMA_PATH", "/nonexistent/schema.prisma")]);
        let err = JobInput::load(&config).unwrap_err();
        assert!(matches!(err, HarnessError::Input { .. }));
    }
}
