//! Batch-scheduler process invocation.
//!
//! The contract with the batch scheduler is process-level only: submission
//! prints a single-line job handle on stdout and exits 0; cancellation takes
//! that handle as its argument.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{SlotError, SlotResult};

static JOB_HANDLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._@\[\]-]+$").expect("job handle pattern is valid")
});

/// What a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Extract the job handle from a submission's output.
    pub fn job_handle(&self) -> SlotResult<String> {
        if !self.success() {
            return Err(SlotError::Command(format!(
                "exit status {:?}: {}",
                self.status,
                self.stderr.trim()
            )));
        }
        let lines: Vec<&str> = self
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        match lines.as_slice() {
            [handle] if JOB_HANDLE.is_match(handle) => Ok(handle.to_string()),
            [handle] => Err(SlotError::Command(format!(
                "malformed job handle: {handle:?}"
            ))),
            [] => Err(SlotError::Command("submission printed no job handle".to_string())),
            _ => Err(SlotError::Command(format!(
                "expected one line of output, got {}",
                lines.len()
            ))),
        }
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> SlotResult<CommandOutput>;
}

/// Runs commands as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], stdin: Option<&str>) -> SlotResult<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SlotError::Command("empty command".to_string()))?;

        let mut child = Command::new(program)
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
            .map_err(|e| SlotError::Command(format!("{program}: {e}")))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| SlotError::Command(format!("{program}: writing stdin: {e}")))?;
            // Closing stdin lets the child see EOF.
            drop(pipe);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SlotError::Command(format!("{program}: timed out after {:?}", self.timeout))
            })?
            .map_err(|e| SlotError::Command(format!("{program}: {e}")))?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(%program, status = ?result.status, "command finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            status: Some(status),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn job_handle_parsing() {
        assert_eq!(output(0, "1234.headnode\n").job_handle().unwrap(), "1234.headnode");
        assert_eq!(output(0, "\n  77[].pbs \n\n").job_handle().unwrap(), "77[].pbs");
        assert!(output(1, "1234.headnode").job_handle().is_err());
        assert!(output(0, "").job_handle().is_err());
        assert!(output(0, "one\ntwo\n").job_handle().is_err());
        assert!(output(0, "has space").job_handle().is_err());
    }

    #[tokio::test]
    async fn process_runner_feeds_stdin() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let argv = vec!["cat".to_string()];
        let out = runner.run(&argv, Some("42.head\n")).await.unwrap();
        assert!(out.success());
        assert_eq!(out.job_handle().unwrap(), "42.head");
    }

    #[tokio::test]
    async fn process_runner_reports_missing_program() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let argv = vec!["/nonexistent/qsub".to_string()];
        assert!(matches!(
            runner.run(&argv, None).await,
            Err(SlotError::Command(_))
        ));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        assert!(runner.run(&[], None).await.is_err());
    }
}
