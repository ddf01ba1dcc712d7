use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::scheduler::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    Failed,
    TimedOut,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Result of one attempt at running a job's command
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn failed(job_id: &str, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: ExecutionStatus::Failed,
            exit_code: None,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Runs a job's command on the local machine.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, job: &Job, timeout: Option<Duration>) -> ExecutionResult;
}

/// Runs commands with `sh -c`, capturing stdout and stderr.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn process_output(
        job_id: &str,
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let (status, error) = if output.status.success() {
                    (ExecutionStatus::Completed, None)
                } else if stderr.is_empty() {
                    (ExecutionStatus::Failed, Some(format!("Exit code: {:?}", exit_code)))
                } else {
                    (ExecutionStatus::Failed, Some(stderr))
                };

                tracing::debug!(
                    job_id = %job_id,
                    status = %status,
                    exit_code = ?exit_code,
                    "Command finished"
                );

                ExecutionResult {
                    job_id: job_id.to_string(),
                    status,
                    exit_code,
                    output: (!stdout.is_empty()).then_some(stdout),
                    error,
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to spawn command");
                ExecutionResult::failed(job_id, e.to_string())
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, job: &Job, timeout: Option<Duration>) -> ExecutionResult {
        tracing::info!(job_id = %job.id, command = %job.command, "Executing job");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => Self::process_output(&job.id, result),
                Err(_) => {
                    tracing::warn!(job_id = %job.id, timeout = ?limit, "Command timed out");
                    ExecutionResult {
                        job_id: job.id.clone(),
                        status: ExecutionStatus::TimedOut,
                        exit_code: None,
                        output: None,
                        error: Some(format!("timed out after {:?}", limit)),
                    }
                }
            },
            None => Self::process_output(&job.id, output.await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(command: &str) -> Job {
        Job::once("shell", command, Utc::now())
    }

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let result = ShellRunner::new().run(&job("echo hello"), None).await;
        assert!(result.succeeded());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output.as_deref(), Some("hello\n"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let result = ShellRunner::new()
            .run(&job("echo oops >&2; exit 3"), None)
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error.as_deref(), Some("oops\n"));
    }

    #[tokio::test]
    async fn test_silent_failure_reports_exit_code() {
        let result = ShellRunner::new().run(&job("exit 1"), None).await;
        assert_eq!(result.error.as_deref(), Some("Exit code: Some(1)"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = ShellRunner::new()
            .run(&job("sleep 5"), Some(Duration::from_millis(100)))
            .await;
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(!result.succeeded());
    }
}
