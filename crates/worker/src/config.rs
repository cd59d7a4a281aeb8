use std::path::PathBuf;
use std::time::Duration;

use crate::runner::RunnerOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Log output format for the stderr subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Read `HARNESS_LOG_FORMAT`. Logging starts before the rest of the
    /// configuration is loaded, so this is read on its own.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("HARNESS_LOG_FORMAT").ok().as_deref())
    }

    /// Unknown or missing values fall back to pretty.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Harness configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub database_url: String,
    pub schema_path: PathBuf,
    pub transaction_path: PathBuf,
    /// Artifact file. When unset the artifact only goes to stdout.
    pub result_path: Option<PathBuf>,
    pub emit_stdout: bool,
    /// Shell command run instead of the built-in migrator.
    pub migrate_command: Option<String>,
    pub migrate_timeout: Duration,
    pub runner: RunnerOptions,
}

impl HarnessConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default            |
    /// |--------------------------------|--------------------|
    /// | `DATABASE_URL`                 | `sqlite::memory:`  |
    /// | `HARNESS_SCHEMA_PATH`          | `schema.prisma`    |
    /// | `HARNESS_TRANSACTION_PATH`     | `transaction.rhai` |
    /// | `HARNESS_RESULT_PATH`          | unset              |
    /// | `HARNESS_EMIT_STDOUT`          | `true`             |
    /// | `HARNESS_ENTRY_POINT`          | `run`              |
    /// | `HARNESS_MIGRATE_COMMAND`      | unset              |
    /// | `HARNESS_MIGRATE_TIMEOUT_SECS` | `30`               |
    /// | `HARNESS_MAX_OPERATIONS`       | `0` (unlimited)    |
    /// | `HARNESS_MAX_CALL_LEVELS`      | `64`               |
    /// | `HARNESS_LOG_FORMAT`           | `pretty`           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").unwrap_or_else(|| "sqlite::memory:".into());
        let schema_path = var("HARNESS_SCHEMA_PATH")
            .unwrap_or_else(|| "schema.prisma".into())
            .into();
        let transaction_path = var("HARNESS_TRANSACTION_PATH")
            .unwrap_or_else(|| "transaction.rhai".into())
            .into();
        let result_path = var("HARNESS_RESULT_PATH").map(PathBuf::from);

        let emit_stdout = match var("HARNESS_EMIT_STDOUT") {
            Some(value) => parse_bool("HARNESS_EMIT_STDOUT", &value)?,
            None => true,
        };

        let migrate_command = var("HARNESS_MIGRATE_COMMAND");
        let migrate_timeout_secs: u64 = parse_number(
            "HARNESS_MIGRATE_TIMEOUT_SECS",
            var("HARNESS_MIGRATE_TIMEOUT_SECS"),
            30,
        )?;

        let defaults = RunnerOptions::default();
        let runner = RunnerOptions {
            entry_point: var("HARNESS_ENTRY_POINT").unwrap_or(defaults.entry_point),
            max_operations: parse_number(
                "HARNESS_MAX_OPERATIONS",
                var("HARNESS_MAX_OPERATIONS"),
                defaults.max_operations,
            )?,
            max_call_levels: parse_number(
                "HARNESS_MAX_CALL_LEVELS",
                var("HARNESS_MAX_CALL_LEVELS"),
                defaults.max_call_levels,
            )?,
        };

        Ok(Self {
            database_url,
            schema_path,
            transaction_path,
            result_path,
            emit_stdout,
            migrate_command,
            migrate_timeout: Duration::from_secs(migrate_timeout_secs),
            runner,
        })
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "a boolean",
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: "a non-negative integer",
            value,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
