//! External migration tool, run as a subprocess.
//!
//! The tool gets `DATABASE_URL` and `SCHEMA_PATH` in its environment and a
//! closed stdin. Its output is captured and logged at `debug`; it never
//! reaches the artifact channel.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::ProvisionError;

/// Maximum stdout or stderr size captured per stream (1 MiB).
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Longest stderr excerpt carried in a [`ProvisionError::Command`].
const MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug)]
pub struct MigratorOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Run `command` through the platform shell and wait at most `timeout`.
///
/// A non-zero exit status is an error carrying the tail of stderr.
pub async fn run_migrator(
    command: &str,
    env: &[(&str, String)],
    timeout: Duration,
) -> Result<MigratorOutput, ProvisionError> {
    let mut cmd = shell(command);
    // `kill_on_drop(true)` kills the tool when the wait below times out.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
    let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
            let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

            for line in stdout.lines().chain(stderr.lines()) {
                tracing::debug!(target: "querylens_db::migrator", "{line}");
            }

            if status.success() {
                tracing::info!(duration_ms, "Migration command finished");
                Ok(MigratorOutput {
                    stdout,
                    stderr,
                    duration_ms,
                })
            } else {
                Err(ProvisionError::Command {
                    exit_code: status.code().unwrap_or(-1),
                    stderr: tail(&stderr),
                })
            }
        }
        Ok(Err(e)) => Err(ProvisionError::Io(e)),
        Err(_elapsed) => Err(ProvisionError::Timeout {
            elapsed_ms: start.elapsed().as_millis() as u64,
        }),
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

fn tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= MAX_ERROR_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - MAX_ERROR_CHARS).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn successful_command_captures_output() {
        let out = run_migrator("echo applied; echo note >&2", &[], TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "applied");
        assert_eq!(out.stderr.trim(), "note");
    }

    #[tokio::test]
    async fn environment_is_passed() {
        let env = [
            ("DATABASE_URL", "sqlite::memory:".to_string()),
            ("SCHEMA_PATH", "/tmp/schema.prisma".to_string()),
        ];
        run_migrator(
            "test \"$DATABASE_URL\" = sqlite::memory: && test \"$SCHEMA_PATH\" = /tmp/schema.prisma",
            &env,
            TIMEOUT,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_error() {
        let err = run_migrator("echo 'drift detected' >&2; exit 3", &[], TIMEOUT)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ProvisionError::Command { exit_code: 3, ref stderr } if stderr == "drift detected"
        );
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run_migrator("sleep 5", &[], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_matches!(err, ProvisionError::Timeout { .. });
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(MAX_ERROR_CHARS) + "END";
        let kept = tail(&long);
        assert_eq!(kept.chars().count(), MAX_ERROR_CHARS);
        assert!(kept.ends_with("END"));
    }
}
