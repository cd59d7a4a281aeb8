use std::panic::AssertUnwindSafe;
use std::process::ExitCode;

use futures::FutureExt;
use querylens_core::result::ExecutionResult;
use querylens_worker::{artifact, HarnessConfig, HarnessResult, JobInput, JobOrchestrator, LogFormat};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing(LogFormat::from_env());

    match AssertUnwindSafe(run()).catch_unwind().await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Harness failed");
            artifact::write_last_resort(result_path().as_deref());
            ExitCode::FAILURE
        }
        Err(_) => {
            tracing::error!("Harness panicked");
            artifact::write_last_resort(result_path().as_deref());
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout carries only the artifact.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "querylens_worker=info,querylens_db=info".into());
    let (pretty, json) = match format {
        LogFormat::Pretty => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();
}

async fn run() -> HarnessResult<()> {
    let config = HarnessConfig::from_env()?;
    tracing::info!(
        database = %querylens_db::redact(&config.database_url),
        schema = %config.schema_path.display(),
        transaction = %config.transaction_path.display(),
        "Harness starting"
    );

    let result = match JobInput::load(&config) {
        Ok(input) => JobOrchestrator::new(&config).run(input).await,
        Err(e) => {
            tracing::error!(error = %e, "Job inputs could not be loaded");
            let mut result = ExecutionResult::new();
            result.record_error(e.to_string(), None);
            result
        }
    };

    artifact::emit(&result, &config)
}

/// The result path as far as it can be known without a valid config.
fn result_path() -> Option<std::path::PathBuf> {
    std::env::var_os("HARNESS_RESULT_PATH")
        .filter(|v| !v.is_empty())
        .map(Into::into)
}
