use std::path::PathBuf;

use crate::config::ConfigError;

/// Failures outside user code that stop the harness from reporting normally.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot read {}: {source}", path.display())]
    Input {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write artifact {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write artifact to stdout: {0}")]
    Stdout(std::io::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
