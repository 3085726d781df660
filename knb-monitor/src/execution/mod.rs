//! Script execution for the agent.
//!
//! Profiling and system-info collection are delegated to scripts shipped in
//! the agent image; every invocation is bounded by a timeout.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Script execution result
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

impl ExecutionResult {
    /// Turns a non-zero exit into an error carrying stderr.
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow!(
                "{} exited with {:?}: {}",
                what,
                self.exit_code,
                self.stderr.trim()
            ))
        }
    }
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Run `program` with `args`, killing it after `timeout`.
    pub async fn execute(program: &Path, args: &[&str], timeout: Duration) -> Result<ExecutionResult> {
        let start_time = Instant::now();
        debug!("Executing {} {:?} (timeout: {:?})", program.display(), args, timeout);

        let output = tokio::time::timeout(
            timeout,
            AsyncCommand::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("{} timed out after {:?}", program.display(), timeout))?
        .with_context(|| format!("Failed to execute {}", program.display()))?;

        Ok(ExecutionResult {
            success: output.status.success(),
            output: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_execution() {
        let result = CommandExecutor::execute(Path::new("echo"), &["Hello", "World"], Duration::from_secs(5))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output, b"Hello World\n");
        assert!(result.execution_time_ms < 5000);
    }

    #[tokio::test]
    async fn test_failed_script_is_reported() {
        let result = CommandExecutor::execute(Path::new("false"), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.check("false").is_err());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let result = CommandExecutor::execute(Path::new("sleep"), &["10"], Duration::from_millis(200)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = CommandExecutor::execute(Path::new("/nonexistent/perf-record.sh"), &[], Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
