//! Persistent container session ("workspace" container).
//!
//! One session owns at most one container. The lifecycle is
//! `NotStarted → Starting → Running → Stopping → NotStarted`; `exec`,
//! `write_file` and `read_file` are only valid while `Running`, and fail with
//! [`SandboxError::NotStarted`] otherwise. Nothing here starts a container
//! implicitly.
//!
//! Concurrent `exec` calls are not serialized: they race inside the
//! container. Callers that need ordering must await one before the next.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::runtime::{ContainerRuntime, ContainerSpec, ExecRequest};
use crate::config::ContainerConfig;
use crate::error::{Result, SandboxError};
use crate::policy::{split_command, ParsedCommand};
use crate::sandbox::process::ProcessOutput;
use crate::task::{
    ExecutionResult, ExecutionTask, FailureKind, IsolationTier, Outcome, TaskKind,
    DEFAULT_TIMEOUT_MS, MEMORY_MARKER, TIMEOUT_MARKER,
};

/// Label carrying the owning session id on every container we create.
pub const SESSION_LABEL: &str = "fluux-sandbox.session";

/// Deadline for the `mkdir`, `stat` and `rm` housekeeping execs.
const PREPARE_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code of a process killed with SIGKILL (128 + 9).
const SIGKILL_EXIT: i32 = 137;

/// Identity of the container owned by a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerHandle {
    pub session_id: Uuid,
    pub container_id: String,
    pub container_name: String,
    pub base_image: String,
    pub created_at: DateTime<Utc>,
    pub network_isolated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running(ContainerHandle),
    Stopping,
}

pub struct ContainerSession {
    id: Uuid,
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    max_output: usize,
    default_timeout: Duration,
    state: Mutex<SessionState>,
    /// Serializes start/stop; never held by exec or file transfer.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ContainerSession {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig, max_output: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            runtime,
            config,
            max_output,
            default_timeout: Duration::from_millis(u64::from(DEFAULT_TIMEOUT_MS)),
            state: Mutex::new(SessionState::NotStarted),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Deadline for [`exec`](Self::exec); tasks carry their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deterministic container name for this session.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.config.name_prefix, self.id)
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    /// The live handle, if the session is running.
    pub fn handle(&self) -> Option<ContainerHandle> {
        match &*self.lock_state() {
            SessionState::Running(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Starts the container, or returns the existing handle.
    pub async fn start(&self) -> Result<ContainerHandle> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(handle) = self.handle() {
            return Ok(handle);
        }
        self.set_state(SessionState::Starting);

        let spec = self.spec();
        match self.runtime.create(&spec).await {
            Ok(container_id) => {
                let handle = ContainerHandle {
                    session_id: self.id,
                    container_id,
                    container_name: spec.name,
                    base_image: spec.image,
                    created_at: Utc::now(),
                    network_isolated: !spec.network,
                };
                info!(
                    "Session {} running in container {}",
                    self.id, handle.container_name
                );
                self.set_state(SessionState::Running(handle.clone()));
                Ok(handle)
            }
            Err(e) => {
                warn!("Session {} failed to start: {e}", self.id);
                self.set_state(SessionState::NotStarted);
                Err(match e {
                    unavailable @ SandboxError::InfrastructureUnavailable(_) => unavailable,
                    other => SandboxError::InfrastructureUnavailable(format!(
                        "cannot start container {}: {other}",
                        spec.name
                    )),
                })
            }
        }
    }

    /// Removes the container and clears the handle. Stopping a session that
    /// is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(handle) = self.handle() else {
            return Ok(());
        };
        self.set_state(SessionState::Stopping);
        let result = self.runtime.remove(&handle.container_id).await;
        // The handle is gone either way; a failed removal is only logged
        self.set_state(SessionState::NotStarted);
        match result {
            Ok(()) => {
                info!("Session {} stopped", self.id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Session {}: removing {} failed: {e}",
                    self.id, handle.container_name
                );
                Err(e)
            }
        }
    }

    /// Runs `command` inside the container after making sure
    /// `working_directory` exists.
    ///
    /// The line is split into words and executed as an argv; no shell sees
    /// it, so the program that runs is the first word exactly as written.
    pub async fn exec(&self, command: &str, working_directory: &str) -> Result<ExecutionResult> {
        let handle = self.running()?;
        let started = Instant::now();
        let outcome = match split_command(command) {
            Ok(parsed) => {
                let discard = Discard::from(&parsed);
                let request = ExecRequest::new(parsed.argv, self.default_timeout, self.max_output);
                self.exec_in(&handle, request, working_directory, discard)
                    .await?
            }
            Err(reason) => failed_outcome(format!("Malformed command: {reason}")),
        };
        Ok(ExecutionResult::from_outcome(
            Uuid::new_v4(),
            IsolationTier::Container,
            outcome,
            started,
        ))
    }

    /// Runs a whole task in this session. Commands run as a plain argv (body
    /// words followed by the task's arguments); scripts are copied in, run
    /// with the configured interpreter and deleted afterwards.
    ///
    /// Anything that goes wrong inside the container, including an unusable
    /// working directory, is an unsuccessful result for `task`.
    pub async fn run_task(&self, task: &ExecutionTask) -> Result<ExecutionResult> {
        let handle = self.running()?;
        let started = Instant::now();
        let workdir = task
            .working_directory()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| self.config.workdir.clone());

        debug!(
            "Session {}: task {} ({:?}) in {workdir}",
            self.id,
            task.id(),
            task.kind()
        );
        let outcome = match task.kind() {
            TaskKind::ShellCommand => match split_command(task.body()) {
                Ok(mut parsed) => {
                    parsed.argv.extend(task.args().iter().cloned());
                    let discard = Discard::from(&parsed);
                    let request = task_request(task, parsed.argv, self.max_output);
                    self.exec_in(&handle, request, &workdir, discard).await?
                }
                Err(reason) => failed_outcome(format!("Malformed command: {reason}")),
            },
            TaskKind::Script => self.run_script(&handle, task, &workdir).await?,
        };
        Ok(ExecutionResult::from_outcome(
            task.id(),
            IsolationTier::Container,
            outcome,
            started,
        ))
    }

    /// Writes `content` to `path` inside the container.
    ///
    /// The bytes go through a uniquely named host temp file and the runtime's
    /// copy primitive; they are never embedded in a command line. The temp
    /// file is deleted on every exit path.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let handle = self.running()?;
        let size = content.len() as u64;
        if size > self.config.max_transfer_bytes {
            return Err(SandboxError::Transfer(format!(
                "{size} bytes exceeds the {} byte transfer limit",
                self.config.max_transfer_bytes
            )));
        }

        let staging = self.staging_file()?;
        tokio::fs::write(staging.path(), content).await?;

        if let Some(parent) = Path::new(path).parent().and_then(|p| p.to_str()) {
            if !parent.is_empty() && parent != "/" {
                self.mkdir(&handle, parent).await?;
            }
        }
        self.runtime
            .copy_in(&handle.container_id, staging.path(), path)
            .await?;
        debug!("Session {}: wrote {size} bytes to {path}", self.id);
        Ok(())
    }

    /// Reads the file at `path` inside the container.
    ///
    /// The size is checked inside the container before anything is copied.
    /// Only a regular file is accepted: a symlink comes out of the copy as a
    /// link and is refused rather than followed on the host.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let handle = self.running()?;
        let size = self.remote_size(&handle, path).await?;
        self.check_transfer_size(path, size)?;

        let staging = self.staging_dir()?;
        let target = staging.path().join("content");
        self.runtime
            .copy_out(&handle.container_id, path, &target)
            .await?;

        let metadata = tokio::fs::symlink_metadata(&target).await?;
        if !metadata.file_type().is_file() {
            return Err(SandboxError::Transfer(format!("{path} is not a regular file")));
        }
        self.check_transfer_size(path, metadata.len())?;
        Ok(tokio::fs::read(&target).await?)
    }

    // ── Internals ─────────────────────────────────────────

    fn spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.container_name(),
            image: self.config.image.clone(),
            network: self.config.network,
            workdir: self.config.workdir.clone(),
            memory_limit_mb: self.config.memory_limit_mb,
            cpus: self.config.cpus,
            pids_limit: self.config.pids_limit,
            labels: BTreeMap::from([(SESSION_LABEL.to_string(), self.id.to_string())]),
        }
    }

    fn running(&self) -> Result<ContainerHandle> {
        match &*self.lock_state() {
            SessionState::Running(handle) => Ok(handle.clone()),
            SessionState::NotStarted => Err(SandboxError::NotStarted(self.container_name())),
            other => Err(SandboxError::InvalidState(format!(
                "session {} is {other:?}",
                self.id
            ))),
        }
    }

    async fn mkdir(&self, handle: &ContainerHandle, dir: &str) -> Result<()> {
        let request = ExecRequest::new(
            vec!["mkdir".to_string(), "-p".to_string(), dir.to_string()],
            PREPARE_TIMEOUT,
            self.max_output,
        );
        let output = self.runtime.exec(&handle.container_id, request).await?;
        if output.exit_code != Some(0) {
            return Err(SandboxError::Runtime(format!(
                "cannot create {dir}: {}",
                output.stderr_lossy().trim()
            )));
        }
        Ok(())
    }

    /// Size in bytes of `path` inside the container, without following links.
    async fn remote_size(&self, handle: &ContainerHandle, path: &str) -> Result<u64> {
        let request = ExecRequest::new(
            vec![
                "stat".to_string(),
                "-c".to_string(),
                "%s".to_string(),
                "--".to_string(),
                path.to_string(),
            ],
            PREPARE_TIMEOUT,
            self.max_output,
        );
        let output = self.runtime.exec(&handle.container_id, request).await?;
        if output.exit_code != Some(0) {
            return Err(SandboxError::Transfer(format!(
                "cannot stat {path}: {}",
                output.stderr_lossy().trim()
            )));
        }
        let size = output.stdout_lossy();
        size.trim().parse().map_err(|_| {
            SandboxError::Transfer(format!("unexpected size for {path}: {:?}", size.trim()))
        })
    }

    fn check_transfer_size(&self, path: &str, size: u64) -> Result<()> {
        if size > self.config.max_transfer_bytes {
            return Err(SandboxError::Transfer(format!(
                "{path} is {size} bytes, over the {} byte transfer limit",
                self.config.max_transfer_bytes
            )));
        }
        Ok(())
    }

    /// Copies the script in, runs it, and deletes it again.
    async fn run_script(
        &self,
        handle: &ContainerHandle,
        task: &ExecutionTask,
        workdir: &str,
    ) -> Result<Outcome> {
        let path = format!(
            "/tmp/fluux-task-{}.{}",
            task.id(),
            task.language().extension()
        );
        if let Err(e) = self.write_file(&path, task.body().as_bytes()).await {
            return task_failure(e);
        }
        let mut argv = vec![self.config.script_interpreter.clone(), path.clone()];
        argv.extend(task.args().iter().cloned());

        let outcome = self
            .exec_in(
                handle,
                task_request(task, argv, self.max_output),
                workdir,
                Discard::default(),
            )
            .await;
        self.remove_file(handle, &path).await;
        outcome
    }

    async fn remove_file(&self, handle: &ContainerHandle, path: &str) {
        let request = ExecRequest::new(
            vec!["rm".to_string(), "-f".to_string(), path.to_string()],
            PREPARE_TIMEOUT,
            self.max_output,
        );
        match self.runtime.exec(&handle.container_id, request).await {
            Ok(output) if output.exit_code == Some(0) => {}
            Ok(output) => warn!(
                "Session {}: removing {path} failed: {}",
                self.id,
                output.stderr_lossy().trim()
            ),
            Err(e) => warn!("Session {}: removing {path} failed: {e}", self.id),
        }
    }

    /// Runs `request` in `working_directory`. A directory that cannot be
    /// created or an exec the runtime refuses is a failed outcome; only an
    /// unreachable runtime is an error.
    async fn exec_in(
        &self,
        handle: &ContainerHandle,
        request: ExecRequest,
        working_directory: &str,
        discard: Discard,
    ) -> Result<Outcome> {
        if let Err(e) = self.mkdir(handle, working_directory).await {
            return task_failure(e);
        }
        let timeout = request.timeout;
        let mut output = match self
            .runtime
            .exec(&handle.container_id, request.in_dir(working_directory))
            .await
        {
            Ok(output) => output,
            Err(e) => return task_failure(e),
        };
        if discard.stdout {
            output.stdout.clear();
        }
        if discard.stderr {
            output.stderr.clear();
        }
        self.classify(handle, output, timeout).await
    }

    async fn classify(
        &self,
        handle: &ContainerHandle,
        output: ProcessOutput,
        timeout: Duration,
    ) -> Result<Outcome> {
        let mut outcome = Outcome {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code: output.exit_code,
            failure: None,
            truncated: output.truncated,
        };
        if output.truncated {
            outcome.stdout.push_str(crate::task::TRUNCATION_MARKER);
        }

        if output.timed_out {
            warn!(
                "Session {}: command killed after {}ms",
                self.id,
                timeout.as_millis()
            );
            outcome.exit_code = None;
            outcome.failure = Some(FailureKind::Timeout);
            push_line(
                &mut outcome.stderr,
                &format!("{TIMEOUT_MARKER} after {}ms", timeout.as_millis()),
            );
        } else if output.exit_code == Some(SIGKILL_EXIT)
            && self
                .runtime
                .oom_killed(&handle.container_id)
                .await
                .unwrap_or(false)
        {
            outcome.failure = Some(FailureKind::ResourceExceeded);
            push_line(&mut outcome.stderr, MEMORY_MARKER);
        } else if output.exit_code != Some(0) {
            outcome.failure = Some(FailureKind::RuntimeFailure);
        }
        Ok(outcome)
    }

    fn staging_file(&self) -> Result<tempfile::NamedTempFile> {
        let file = match &self.config.temp_dir {
            Some(dir) => tempfile::Builder::new().prefix("fluux-xfer-").tempfile_in(dir)?,
            None => tempfile::Builder::new().prefix("fluux-xfer-").tempfile()?,
        };
        Ok(file)
    }

    fn staging_dir(&self) -> Result<tempfile::TempDir> {
        let dir = match &self.config.temp_dir {
            Some(dir) => tempfile::Builder::new().prefix("fluux-xfer-").tempdir_in(dir)?,
            None => tempfile::Builder::new().prefix("fluux-xfer-").tempdir()?,
        };
        Ok(dir)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        // A panic while holding this lock leaves a plain enum behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        let Some(handle) = self.handle() else {
            return;
        };
        // Best-effort cleanup when a session is dropped without stop()
        warn!(
            "Session {} dropped while running, removing {}",
            self.id, handle.container_name
        );
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = runtime.remove(&handle.container_id).await {
                        warn!("Cleanup of {} failed: {e}", handle.container_name);
                    }
                });
            }
            Err(_) => warn!(
                "No async runtime to remove {}; remove it manually",
                handle.container_name
            ),
        }
    }
}

/// `/dev/null` redirections lifted out of a command line.
#[derive(Debug, Clone, Copy, Default)]
struct Discard {
    stdout: bool,
    stderr: bool,
}

impl From<&ParsedCommand> for Discard {
    fn from(parsed: &ParsedCommand) -> Self {
        Self {
            stdout: parsed.discard_stdout,
            stderr: parsed.discard_stderr,
        }
    }
}

fn task_request(task: &ExecutionTask, argv: Vec<String>, max_output: usize) -> ExecRequest {
    ExecRequest::new(argv, task.timeout(), max_output).with_env(task.environment().clone())
}

fn failed_outcome(message: String) -> Outcome {
    Outcome {
        stderr: message,
        failure: Some(FailureKind::RuntimeFailure),
        ..Outcome::default()
    }
}

/// Session state and runtime reachability errors propagate; anything else
/// belongs to the task.
fn task_failure(error: SandboxError) -> Result<Outcome> {
    match error {
        fatal @ (SandboxError::InfrastructureUnavailable(_)
        | SandboxError::NotStarted(_)
        | SandboxError::InvalidState(_)) => Err(fatal),
        other => Ok(failed_outcome(other.to_string())),
    }
}

fn push_line(buffer: &mut String, line: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(line);
}
