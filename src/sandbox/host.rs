//! Direct host execution, only reachable through insecure fallback.
//!
//! The command has already passed the validator. It runs as a plain argv:
//! no shell, a cleared environment with a fixed PATH, and the same deadline
//! and output cap as every other tier.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::error::Result;
use crate::policy::ParsedCommand;
use crate::sandbox::process::run_with_deadline;
use crate::task::{
    ExecutionResult, ExecutionTask, FailureKind, IsolationTier, Outcome,
    TIMEOUT_MARKER, TRUNCATION_MARKER,
};

/// Seam between the coordinator and the host, so routing can be tested
/// without spawning anything.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    async fn run(
        &self,
        task: &ExecutionTask,
        command: &ParsedCommand,
        max_output: usize,
    ) -> Result<ExecutionResult>;
}

pub struct HostCommandRunner {
    config: HostConfig,
}

impl HostCommandRunner {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    fn working_directory(&self, task: &ExecutionTask) -> Option<PathBuf> {
        task.working_directory()
            .map(PathBuf::from)
            .or_else(|| self.config.working_directory.clone())
    }
}

#[async_trait]
impl HostExecutor for HostCommandRunner {
    async fn run(
        &self,
        task: &ExecutionTask,
        command: &ParsedCommand,
        max_output: usize,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let Some((program, rest)) = command.argv.split_first() else {
            return Ok(failed_to_start(task, "empty command", started));
        };

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .args(task.args())
            .env_clear()
            .env("PATH", &self.config.path)
            .envs(task.environment());
        if let Some(dir) = self.working_directory(task) {
            cmd.current_dir(dir);
        }

        debug!("Task {}: host exec {program}", task.id());
        let output = match run_with_deadline(cmd, None, task.timeout(), max_output).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Task {}: failed to start {program}: {e}", task.id());
                return Ok(failed_to_start(task, &format!("{program}: {e}"), started));
            }
        };

        let mut outcome = Outcome {
            stdout: if command.discard_stdout {
                String::new()
            } else {
                output.stdout_lossy()
            },
            stderr: if command.discard_stderr {
                String::new()
            } else {
                output.stderr_lossy()
            },
            exit_code: output.exit_code,
            failure: None,
            truncated: output.truncated,
        };
        if output.truncated {
            outcome.stdout.push_str(TRUNCATION_MARKER);
        }

        if output.timed_out {
            outcome.exit_code = None;
            outcome.failure = Some(FailureKind::Timeout);
            if !outcome.stderr.is_empty() && !outcome.stderr.ends_with('\n') {
                outcome.stderr.push('\n');
            }
            outcome.stderr.push_str(&format!(
                "{TIMEOUT_MARKER} after {}ms",
                task.timeout_ms()
            ));
        } else if output.exit_code != Some(0) {
            outcome.failure = Some(FailureKind::RuntimeFailure);
        }

        Ok(ExecutionResult::from_outcome(
            task.id(),
            IsolationTier::InProcess,
            outcome,
            started,
        ))
    }
}

fn failed_to_start(task: &ExecutionTask, reason: &str, started: Instant) -> ExecutionResult {
    ExecutionResult::from_outcome(
        task.id(),
        IsolationTier::InProcess,
        Outcome {
            stderr: format!("Failed to start command: {reason}"),
            failure: Some(FailureKind::RuntimeFailure),
            ..Outcome::default()
        },
        started,
    )
}
