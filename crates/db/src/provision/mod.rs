//! Schema provisioning.
//!
//! [`Provisioner::provision`] never fails. It tries the primary path (an
//! external migration tool when configured, the built-in
//! [`incremental`] migrator otherwise), falls back to [`sync::force_sync`],
//! and if both fail checks whether the database already has every declared
//! table and column. Only when it does not is the failure reported, as a
//! schema error on the [`ProvisionReport`].

pub mod external;
pub mod incremental;
pub mod sync;

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use querylens_core::error::CoreError;
use querylens_core::schema::Schema;

use crate::introspect::Snapshot;
use crate::{Connection, DbError};

/// Default bound on the primary path.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("{0}")]
    Schema(#[from] CoreError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Cannot migrate {table}.{column}: {reason}")]
    Conflict {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Migration command exited with code {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("Migration command could not be run: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

impl ProvisionError {
    pub fn conflict(table: &str, column: &str, reason: impl Into<String>) -> Self {
        Self::Conflict {
            table: table.to_string(),
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Passed to the external tool as `DATABASE_URL`.
    pub database_url: String,
    /// Passed to the external tool as `SCHEMA_PATH`. When unset the schema
    /// source is written to a temporary file for the duration of the call.
    pub schema_path: Option<PathBuf>,
    /// Shell command used as the primary path instead of the built-in
    /// incremental migrator.
    pub migrate_command: Option<String>,
    pub timeout: Duration,
}

impl ProvisionOptions {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            schema_path: None,
            migrate_command: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The schema checksum was already recorded.
    UpToDate,
    /// The incremental migrator applied this many statements.
    Migrated { statements: usize },
    /// The external migration tool succeeded.
    ExternalTool,
    /// All user tables were dropped and this many tables recreated.
    ForceSynced { tables: usize },
    /// Both paths failed but every declared table and column exists.
    AlreadySatisfied,
    /// Both paths failed and the database does not match the schema.
    Failed(String),
}

impl fmt::Display for ProvisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("up to date"),
            Self::Migrated { statements } => write!(f, "migrated ({statements} statements)"),
            Self::ExternalTool => f.write_str("migrated by external tool"),
            Self::ForceSynced { tables } => write!(f, "force synced ({tables} tables)"),
            Self::AlreadySatisfied => f.write_str("already satisfied"),
            Self::Failed(_) => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub outcome: ProvisionOutcome,
    /// Why the primary path failed, when the fallback was used.
    pub primary_error: Option<String>,
    pub duration: Duration,
}

impl ProvisionReport {
    /// Message for the result's `schema_error` field, if provisioning
    /// ultimately failed.
    pub fn schema_error(&self) -> Option<&str> {
        match &self.outcome {
            ProvisionOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }
}

pub struct Provisioner<'a> {
    conn: &'a Connection,
    options: &'a ProvisionOptions,
}

impl<'a> Provisioner<'a> {
    pub fn new(conn: &'a Connection, options: &'a ProvisionOptions) -> Self {
        Self { conn, options }
    }

    pub async fn provision(&self, source: &str) -> ProvisionReport {
        let started = Instant::now();
        let (outcome, primary_error) = self.run(source).await;
        let report = ProvisionReport {
            outcome,
            primary_error,
            duration: started.elapsed(),
        };
        tracing::info!(
            outcome = %report.outcome,
            duration_ms = report.duration.as_millis() as u64,
            "Schema provisioning finished"
        );
        report
    }

    async fn run(&self, source: &str) -> (ProvisionOutcome, Option<String>) {
        let schema = match Schema::parse(source) {
            Ok(schema) => schema,
            Err(e) => {
                tracing::error!(error = %e, "Schema could not be parsed");
                let message = format!("Schema provisioning failed: {e}");
                return (ProvisionOutcome::Failed(message), None);
            }
        };

        let primary_error = match self.primary(&schema, source).await {
            Ok(outcome) => return (outcome, None),
            Err(e) => {
                tracing::warn!(error = %e, "Primary migration failed, falling back to force sync");
                e.to_string()
            }
        };

        let outcome = match sync::force_sync(self.conn, &schema, source).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Force sync failed");
                self.settle(&schema, &primary_error, &e.to_string()).await
            }
        };
        (outcome, Some(primary_error))
    }

    async fn primary(
        &self,
        schema: &Schema,
        source: &str,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        if let Some(command) = &self.options.migrate_command {
            return self.external(command, source).await;
        }

        let started = Instant::now();
        match tokio::time::timeout(
            self.options.timeout,
            incremental::migrate(self.conn, schema, source),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(ProvisionError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn external(
        &self,
        command: &str,
        source: &str,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        // Held until the tool exits.
        let mut scratch = None;
        let schema_path = match &self.options.schema_path {
            Some(path) => path.clone(),
            None => {
                let file = tempfile::Builder::new()
                    .prefix("querylens-schema-")
                    .suffix(".prisma")
                    .tempfile()?;
                std::fs::write(file.path(), source)?;
                let path = file.path().to_path_buf();
                scratch = Some(file);
                path
            }
        };

        let env = [
            ("DATABASE_URL", self.options.database_url.clone()),
            ("SCHEMA_PATH", schema_path.display().to_string()),
        ];
        external::run_migrator(command, &env, self.options.timeout).await?;
        drop(scratch);
        Ok(ProvisionOutcome::ExternalTool)
    }

    /// Decide the outcome once both paths have failed.
    async fn settle(&self, schema: &Schema, primary: &str, fallback: &str) -> ProvisionOutcome {
        match Snapshot::capture(self.conn).await {
            Ok(snapshot) if snapshot.satisfies(schema) => {
                tracing::warn!(
                    primary,
                    fallback,
                    "Both migration paths failed but the database already matches the schema"
                );
                ProvisionOutcome::AlreadySatisfied
            }
            Ok(_) => ProvisionOutcome::Failed(format!(
                "Schema provisioning failed: {primary}; fallback failed: {fallback}"
            )),
            Err(e) => ProvisionOutcome::Failed(format!(
                "Schema provisioning failed: {primary}; fallback failed: {fallback}; introspection failed: {e}"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use querylens_core::query::CallStack;
    use querylens_core::sql::SqlValue;
    use querylens_events::QueryBus;

    use super::*;
    use crate::introspect::Snapshot;

    const DRIVERS: &str = "model Driver {\n  id   Int    @id @default(autoincrement())\n  name String\n}\n";
    const DRIVERS_WITH_TEAM: &str = "model Driver {\n  id   Int    @id @default(autoincrement())\n  name String\n  team String?\n}\n";

    async fn conn() -> Connection {
        Connection::open("sqlite::memory:", Arc::new(QueryBus::default()))
            .await
            .unwrap()
    }

    fn options() -> ProvisionOptions {
        ProvisionOptions::new("sqlite::memory:")
    }

    #[tokio::test]
    async fn fresh_database_is_migrated_then_up_to_date() {
        let conn = conn().await;
        let options = options();
        let provisioner = Provisioner::new(&conn, &options);

        let first = provisioner.provision(DRIVERS).await;
        assert_eq!(first.outcome, ProvisionOutcome::Migrated { statements: 1 });
        assert!(first.schema_error().is_none());

        let second = provisioner.provision(DRIVERS).await;
        assert_eq!(second.outcome, ProvisionOutcome::UpToDate);
    }

    #[tokio::test]
    async fn missing_column_is_added_and_data_kept() {
        let conn = conn().await;
        let options = options();
        let provisioner = Provisioner::new(&conn, &options);
        provisioner.provision(DRIVERS).await;
        conn.execute(
            "INSERT INTO \"Driver\" (name) VALUES (?)",
            &[SqlValue::Text("Oscar".into())],
            CallStack::empty(),
        )
        .await
        .unwrap();

        let report = provisioner.provision(DRIVERS_WITH_TEAM).await;
        assert_eq!(report.outcome, ProvisionOutcome::Migrated { statements: 1 });

        let rows = conn
            .fetch("SELECT name, team FROM \"Driver\"", &[], CallStack::empty())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["team"], SqlValue::Null);
    }

    #[tokio::test]
    async fn conflict_falls_back_to_force_sync() {
        let conn = conn().await;
        conn.execute(
            "CREATE TABLE \"Driver\" (id INTEGER PRIMARY KEY, name INTEGER)",
            &[],
            CallStack::empty(),
        )
        .await
        .unwrap();

        let options = options();
        let report = Provisioner::new(&conn, &options).provision(DRIVERS).await;
        assert_eq!(report.outcome, ProvisionOutcome::ForceSynced { tables: 1 });
        assert!(report.primary_error.unwrap().contains("Driver.name"));

        let snapshot = Snapshot::capture(&conn).await.unwrap();
        assert_eq!(snapshot.column("Driver", "name").unwrap().data_type, "TEXT");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_external_tool_falls_back() {
        let conn = conn().await;
        let mut options = options();
        options.migrate_command = Some("echo 'cannot reach engine' >&2; exit 1".to_string());

        let report = Provisioner::new(&conn, &options).provision(DRIVERS).await;
        assert_eq!(report.outcome, ProvisionOutcome::ForceSynced { tables: 1 });
        assert!(report.primary_error.unwrap().contains("cannot reach engine"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_tool_sees_schema_file() {
        let conn = conn().await;
        let mut options = options();
        options.migrate_command = Some("grep -q 'model Driver' \"$SCHEMA_PATH\"".to_string());

        let report = Provisioner::new(&conn, &options).provision(DRIVERS).await;
        assert_eq!(report.outcome, ProvisionOutcome::ExternalTool);
    }

    #[tokio::test]
    async fn unparseable_schema_is_a_schema_error() {
        let conn = conn().await;
        let options = options();
        let report = Provisioner::new(&conn, &options)
            .provision("model Driver {\n  id Int @id\n  car Car\n}\n")
            .await;
        assert_matches!(report.outcome, ProvisionOutcome::Failed(_));
        assert!(report.schema_error().unwrap().contains("line 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn both_paths_failing_reports_schema_error() {
        let conn = conn().await;
        let mut options = options();
        options.migrate_command = Some("exit 1".to_string());

        // Table names starting with sqlite_ are reserved, so the fallback fails too.
        let schema = "model Stat {\n  id Int @id\n  @@map(\"sqlite_stat9\")\n}\n";
        let report = Provisioner::new(&conn, &options).provision(schema).await;
        let message = report.schema_error().unwrap();
        assert!(message.contains("exit"));
        assert!(message.contains("fallback failed"));
    }

    #[tokio::test]
    async fn satisfied_database_is_accepted_after_both_fail() {
        let conn = conn().await;
        conn.execute(
            "CREATE TABLE \"Driver\" (id INTEGER PRIMARY KEY, name TEXT)",
            &[],
            CallStack::empty(),
        )
        .await
        .unwrap();

        let options = options();
        let provisioner = Provisioner::new(&conn, &options);
        let schema = Schema::parse(DRIVERS).unwrap();
        let outcome = provisioner.settle(&schema, "primary", "fallback").await;
        assert_eq!(outcome, ProvisionOutcome::AlreadySatisfied);

        let wider = Schema::parse(DRIVERS_WITH_TEAM).unwrap();
        let outcome = provisioner.settle(&wider, "primary", "fallback").await;
        assert_matches!(outcome, ProvisionOutcome::Failed(ref m) if m.contains("fallback failed"));
    }
}
