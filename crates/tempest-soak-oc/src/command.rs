//! `oc` process execution with a per-call timeout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tempest_soak_core::ClusterError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one `oc` invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `oc` (or a compatible binary) with a bounded wall-clock time.
#[derive(Debug, Clone)]
pub struct OcRunner {
    binary: String,

    /// Arguments placed before every command, e.g. `--kubeconfig <path>`.
    global_args: Vec<String>,
    timeout: Duration,
}

impl OcRunner {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            global_args: Vec::new(),
            timeout,
        }
    }

    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute with `args`, optionally feeding `stdin`.
    ///
    /// A timeout is `Transient`; a binary that cannot be started is
    /// `Terminal`. A non-zero exit is returned as output for the caller to
    /// classify.
    pub async fn run(
        &self,
        operation: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, ClusterError> {
        let start = Instant::now();

        let mut child = Command::new(&self.binary)
            .args(&self.global_args)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClusterError::terminal(operation, format!("failed to start {}: {e}", self.binary))
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| ClusterError::transient(operation, format!("stdin write failed: {e}")))?;
            // Close stdin so the child sees EOF.
            drop(pipe);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ClusterError::transient(
                    operation,
                    format!("timed out after {} seconds", self.timeout.as_secs_f32()),
                )
            })?
            .map_err(|e| ClusterError::transient(operation, e.to_string()))?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            operation,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "oc command finished"
        );
        Ok(result)
    }
}

/// Map a failed command to an error kind. `target` names the object for
/// `NotFound`.
pub fn classify_failure(operation: &str, target: (&str, &str), output: &CommandOutput) -> ClusterError {
    let stderr = output.stderr.trim();
    if stderr.contains("Unauthorized") || stderr.contains("Forbidden") || stderr.contains("forbidden") {
        ClusterError::terminal(operation, stderr)
    } else if stderr.contains("NotFound") || stderr.contains("not found") {
        ClusterError::NotFound {
            kind: target.0.to_string(),
            name: target.1.to_string(),
        }
    } else {
        ClusterError::transient(
            operation,
            format!("exit code {}: {}", output.exit_code, stderr),
        )
    }
}
