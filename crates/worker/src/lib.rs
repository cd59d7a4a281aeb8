//! Job harness: loads a schema and a transaction script, provisions the
//! database, runs the script and reports a single JSON artifact.

pub mod artifact;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod runner;

pub use config::{ConfigError, HarnessConfig, LogFormat};
pub use error::{HarnessError, HarnessResult};
pub use orchestrator::{JobInput, JobOrchestrator, JobPhase};
