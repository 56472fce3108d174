//! Runs a job's shell command and reports a structured result.
//!
//! Stateless collaborator, per `spec.md` §4.2: a pure function of
//! `(command, timeout)`. Shell interpretation is intentional — only trusted
//! commands should be enqueued.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{error, warn};

/// The outcome of running a job's command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.returncode == 0
    }
}

/// Executes a job's command. Implementors must never panic on a failing
/// command — failure is data, reported through [`ExecutionResult`].
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> ExecutionResult;
}

/// Runs commands via the system shell (`sh -c`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> ExecutionResult {
        let started = Instant::now();

        let spawned = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!(%command, "command not found");
                return ExecutionResult {
                    returncode: 127,
                    stdout: String::new(),
                    stderr: format!("Command not found: {e}"),
                    duration: started.elapsed(),
                };
            }
            Err(e) => {
                error!(%command, error = %e, "failed to spawn command");
                return ExecutionResult {
                    returncode: -1,
                    stdout: String::new(),
                    stderr: format!("Execution error: {e}"),
                    duration: started.elapsed(),
                };
            }
        };

        let mut stdout_pipe = child.stdout.take().expect("piped stdout");
        let mut stderr_pipe = child.stderr.take().expect("piped stderr");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                ExecutionResult {
                    returncode: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    duration: started.elapsed(),
                }
            }
            Ok(Err(e)) => {
                error!(%command, error = %e, "execution error");
                ExecutionResult {
                    returncode: -1,
                    stdout: String::new(),
                    stderr: format!("Execution error: {e}"),
                    duration: started.elapsed(),
                }
            }
            Err(_) => {
                warn!(%command, timeout_secs = timeout.as_secs(), "command timed out");
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                ExecutionResult {
                    returncode: -1,
                    stdout: String::new(),
                    stderr: format!("Command timed out after {} seconds", timeout.as_secs()),
                    duration: started.elapsed(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = ShellExecutor
            .execute("echo hello", Duration::from_secs(5))
            .await;
        assert!(result.succeeded());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn captures_nonzero_exit_and_stderr() {
        let result = ShellExecutor
            .execute("echo oops 1>&2; exit 3", Duration::from_secs(5))
            .await;
        assert!(!result.succeeded());
        assert_eq!(result.returncode, 3);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn kills_process_tree_on_timeout() {
        let result = ShellExecutor
            .execute("sleep 5", Duration::from_millis(50))
            .await;
        assert!(!result.succeeded());
        assert!(result.stderr.contains("timed out"));
        assert!(result.duration < Duration::from_secs(1));
    }
}
