//! Code execution backends
//!
//! Every backend turns code into a single output string. Faults (timeouts,
//! launch failures) are reported in that string, never as errors.

pub mod inline;

pub use inline::{InlineEvaluator, SKIPPED_NOTICE};

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, warn};

#[async_trait]
pub trait CodeRunner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, code: &str) -> String;
}

/// Runs code with an external interpreter in a throwaway directory.
pub struct PythonSubprocessRunner {
    interpreter: String,
    timeout: Duration,
}

impl PythonSubprocessRunner {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

/// Lossy UTF-8 with NUL bytes removed.
fn sanitize_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\0', "")
}

#[async_trait]
impl CodeRunner for PythonSubprocessRunner {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn run(&self, code: &str) -> String {
        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Failed to create sandbox directory: {}", e);
                return format!("Error: could not create working directory: {}", e);
            }
        };

        let script = workdir.path().join("script.py");
        if let Err(e) = tokio::fs::write(&script, code).await {
            error!("Failed to write sandbox script: {}", e);
            return format!("Error: could not write script: {}", e);
        }

        debug!(interpreter = %self.interpreter, dir = ?workdir.path(), "Running script");

        let child = Command::new(&self.interpreter)
            .arg(&script)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(interpreter = %self.interpreter, "Failed to launch interpreter: {}", e);
                return format!("Error: failed to launch {}: {}", self.interpreter, e);
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs_f64(), "Script timed out");
                return format!(
                    "Timeout: execution exceeded {:.1} seconds and was stopped",
                    self.timeout.as_secs_f64()
                );
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let status = if output.status.success() {
            "execution succeeded"
        } else {
            "execution failed"
        };

        let mut text = sanitize_output(&output.stdout);
        text.push_str(&sanitize_output(&output.stderr));

        format!("exitcode: {} ({})\nCode output: {}", exit_code, status, text.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `sh` stands in for the interpreter so the tests only need a POSIX shell.

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let runner = PythonSubprocessRunner::new("sh", Duration::from_secs(5));
        let output = runner.run("echo 25.0").await;

        assert!(output.starts_with("exitcode: 0 (execution succeeded)"));
        assert!(output.contains("Code output: 25.0"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_includes_stderr() {
        let runner = PythonSubprocessRunner::new("sh", Duration::from_secs(5));
        let output = runner.run("echo oops >&2\nexit 3").await;

        assert!(output.starts_with("exitcode: 3 (execution failed)"));
        assert!(output.contains("oops"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_as_output() {
        let runner = PythonSubprocessRunner::new("sh", Duration::from_millis(200));
        let output = runner.run("sleep 5").await;

        assert!(output.starts_with("Timeout:"));
        assert!(!output.contains("Error"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_reported() {
        let runner = PythonSubprocessRunner::new("no-such-interpreter-here", Duration::from_secs(1));
        let output = runner.run("print(1)").await;

        assert!(output.starts_with("Error: failed to launch"));
    }
}
