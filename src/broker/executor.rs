//! Execution targets: what actually runs once inputs are staged.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::broker::status::ProgressReporter;
use crate::error::ExecutionError;
use crate::orchestrator::JobContext;

/// Result of running a job's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub passed: bool,
    pub message: String,
}

impl JobOutcome {
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Runs the payload of a job inside its workspace.
///
/// Implementations must stop promptly with [`ExecutionError::Cancelled`]
/// when `cancel` fires. A payload that ran and failed is an `Ok` outcome
/// with `passed: false`; `Err` is reserved for not being able to run it.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &JobContext,
        workspace: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, ExecutionError>;
}

/// Runs a local command with the workspace as its working directory.
///
/// Each stdout line is forwarded as a progress report. Stderr is logged at
/// debug level and its tail is attached to the failure message.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

const STDERR_TAIL_LINES: usize = 20;

/// How long output is still read once the command has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

impl CommandExecutor {
    /// Build from a program followed by its arguments.
    pub fn new(command: Vec<String>) -> Result<Self, ExecutionError> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or(ExecutionError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(
        &self,
        ctx: &JobContext,
        workspace: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(workspace)
            .env("TASKBROKER_JOB_ID", ctx.job_id.to_string())
            .env("TASKBROKER_PLAN_ID", ctx.plan_id.to_string())
            .env("TASKBROKER_WORKSPACE", workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            program = %self.program,
            workspace = %workspace.display(),
            "Spawning job command"
        );
        let mut child = cmd.spawn().map_err(|source| ExecutionError::SpawnFailed {
            program: self.program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr was not captured"))?;

        let program = self.program.clone();
        let mut stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(program = %program, "stderr: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;
        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(program = %self.program, "Cancelling job command");
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill job command: {}", e);
                    }
                    stderr_handle.abort();
                    return Err(ExecutionError::Cancelled);
                }
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => forward(progress, &line).await,
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::debug!("Stopped reading job stdout: {}", e);
                        stdout_open = false;
                    }
                },
                status = child.wait() => break status?,
            }
        };

        // Background processes may inherit the pipes and keep them open long
        // after the command itself has exited.
        let drain = async {
            while stdout_open {
                match lines.next_line().await {
                    Ok(Some(line)) => forward(progress, &line).await,
                    _ => stdout_open = false,
                }
            }
            (&mut stderr_handle).await.unwrap_or_default()
        };
        let stderr_tail = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(program = %self.program, "Cancelled while draining job output");
                stderr_handle.abort();
                return Err(ExecutionError::Cancelled);
            }
            drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain) => match drained {
                Ok(tail) => tail,
                Err(_) => {
                    tracing::warn!(
                        program = %self.program,
                        "Job output still open {:?} after exit, not waiting for it",
                        OUTPUT_DRAIN_TIMEOUT
                    );
                    stderr_handle.abort();
                    String::new()
                }
            },
        };

        if status.success() {
            return Ok(JobOutcome::passed(format!("{} succeeded", self.program)));
        }

        let code = status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let mut message = format!("{} exited with {}", self.program, code);
        if !stderr_tail.is_empty() {
            message.push('\n');
            message.push_str(&stderr_tail);
        }
        Ok(JobOutcome::failed(message))
    }
}

async fn forward(progress: &ProgressReporter, line: &str) {
    let trimmed = line.trim_end();
    if !trimmed.is_empty() {
        progress.report(trimmed).await;
    }
}
