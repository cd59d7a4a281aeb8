//! Artifact emission.
//!
//! The serialized result is produced once and then written to the result
//! file (when configured) and as a single line on stdout (when enabled).
//! Nothing else in the process writes to stdout.

use std::io::Write;
use std::path::Path;

use querylens_core::result::ExecutionResult;
use querylens_core::serializer::{self, LAST_RESORT_ARTIFACT};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};

/// Serialize `result` and deliver it to every configured destination.
pub fn emit(result: &ExecutionResult, config: &HarnessConfig) -> HarnessResult<()> {
    let artifact = serializer::serialize_result(result);
    let mut stdout = std::io::stdout().lock();
    deliver(
        &artifact,
        config.result_path.as_deref(),
        config.emit_stdout.then_some(&mut stdout as &mut dyn Write),
    )
}

/// Write `artifact` to `path` and `out`. Both destinations are attempted;
/// an error is returned only when no requested destination received it.
pub fn deliver(
    artifact: &str,
    path: Option<&Path>,
    out: Option<&mut dyn Write>,
) -> HarnessResult<()> {
    let mut delivered = false;
    let mut first_error = None;

    if let Some(path) = path {
        match write_artifact(path, artifact) {
            Ok(()) => delivered = true,
            Err(e) => {
                tracing::error!(error = %e, "Artifact file could not be written");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(out) = out {
        match write_line(out, artifact) {
            Ok(()) => delivered = true,
            Err(e) => {
                tracing::error!(error = %e, "Artifact could not be written to stdout");
                first_error.get_or_insert(HarnessError::Stdout(e));
            }
        }
    }

    match first_error {
        Some(e) if !delivered => Err(e),
        _ => Ok(()),
    }
}

pub fn write_artifact(path: &Path, artifact: &str) -> HarnessResult<()> {
    std::fs::write(path, artifact).map_err(|source| HarnessError::Artifact {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), bytes = artifact.len(), "Artifact written");
    Ok(())
}

fn write_line(out: &mut dyn Write, artifact: &str) -> std::io::Result<()> {
    out.write_all(artifact.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Last-resort output when the job itself could not complete. Best effort
/// on both destinations.
pub fn write_last_resort(path: Option<&Path>) {
    if let Some(path) = path {
        if let Err(e) = std::fs::write(path, LAST_RESORT_ARTIFACT) {
            tracing::error!(path = %path.display(), error = %e, "Last-resort artifact could not be written");
        }
    }
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = write_line(&mut stdout, LAST_RESORT_ARTIFACT) {
        tracing::error!(error = %e, "Last-resort artifact could not be written to stdout");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn delivers_to_file_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let mut out = Vec::new();

        deliver(r#"{"output":"hi"}"#, Some(&path), Some(&mut out)).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"output":"hi"}"#);
        assert_eq!(String::from_utf8(out).unwrap(), "{\"output\":\"hi\"}\n");
    }

    #[test]
    fn stream_only_when_no_path() {
        let mut out = Vec::new();
        deliver("{}", None, Some(&mut out)).unwrap();
        assert_eq!(out, b"{}\n");
    }

    #[test]
    fn unwritable_file_still_reaches_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("result.json");
        let mut out = Vec::new();

        deliver("{}", Some(&path), Some(&mut out)).unwrap();

        assert!(!path.exists());
        assert_eq!(out, b"{}\n");
    }

    #[test]
    fn fails_when_nothing_was_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("result.json");

        let err = deliver("{}", Some(&path), None).unwrap_err();
        assert_matches!(err, HarnessError::Artifact { .. });
    }

    #[test]
    fn emitted_artifact_is_one_line() {
        let mut result = ExecutionResult::new();
        result.output = "Lewis\nMax".into();
        let artifact = serializer::serialize_result(&result);
        let mut out = Vec::new();

        deliver(&artifact, None, Some(&mut out)).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        let json: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(json["output"], "Lewis\nMax");
    }
}
