//! Timeout-bounded shell execution.
//!
//! Every cluster call goes through here, so nothing the controller runs can
//! block forever.

use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{cmd}` timed out after {timeout:?}")]
    Timeout { cmd: String, timeout: Duration },
    #[error("`{cmd}` exited with {code:?}: {stderr}")]
    Failed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Shell runner with a fixed per-call timeout.
#[derive(Debug, Clone)]
pub struct Shell {
    timeout: Duration,
}

impl Shell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, cmd: &str) -> Result<Output, ExecError> {
        let start = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ExecError::Timeout {
                cmd: cmd.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| ExecError::Spawn {
                cmd: cmd.to_string(),
                source,
            })?;
        debug!("`{}` finished in {}ms ({})", cmd, start.elapsed().as_millis(), output.status);

        if !output.status.success() {
            return Err(ExecError::Failed {
                cmd: cmd.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    pub async fn exec_cmd(&self, cmd: &str) -> Result<(), ExecError> {
        self.run(cmd).await.map(|_| ())
    }

    /// Trimmed, non-empty stdout lines.
    pub async fn exec_cmd_lines(&self, cmd: &str) -> Result<Vec<String>, ExecError> {
        let output = self.run(cmd).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub async fn exec_cmd_output(&self, cmd: &str) -> Result<Vec<u8>, ExecError> {
        Ok(self.run(cmd).await?.stdout)
    }
}
