//! Docker CLI implementation of [`ContainerRuntime`].
//!
//! Drives the `docker` binary (or a CLI-compatible engine such as `podman`)
//! with argv-only invocations. Commands exec'd inside a container are wrapped
//! in `timeout -s KILL` so the deadline is enforced by the container's own
//! kernel namespace as well as by killing the client process on the host.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::runtime::{ContainerRuntime, ContainerSpec, ExecRequest};
use crate::config::ContainerConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::process::{run_with_deadline, ProcessOutput};

/// How long an availability probe result is reused.
const AVAILABILITY_TTL: Duration = Duration::from_secs(30);

/// Timeout for the availability probe itself.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Output ceiling for lifecycle commands (ids, inspect output, errors).
const MANAGEMENT_OUTPUT: usize = 64 * 1024;

pub struct DockerCli {
    binary: String,
    management_timeout: Duration,
    kill_wrapper: bool,
    availability: Mutex<Option<(Instant, bool)>>,
}

impl DockerCli {
    pub fn new(config: &ContainerConfig) -> Self {
        Self {
            binary: config.runtime.clone(),
            management_timeout: Duration::from_secs(config.management_timeout_secs),
            kill_wrapper: config.kill_wrapper,
            availability: Mutex::new(None),
        }
    }

    /// Runs a lifecycle command and fails unless it exits 0.
    async fn docker(&self, args: Vec<String>) -> Result<ProcessOutput> {
        let verb = args.first().cloned().unwrap_or_default();
        let mut command = Command::new(&self.binary);
        command.args(&args);
        let output = run_with_deadline(command, None, self.management_timeout, MANAGEMENT_OUTPUT)
            .await
            .map_err(|e| SandboxError::Runtime(format!("{} {verb}: {e}", self.binary)))?;

        if output.timed_out {
            return Err(SandboxError::Runtime(format!(
                "{} {verb} timed out after {}s",
                self.binary,
                self.management_timeout.as_secs()
            )));
        }
        if output.exit_code != Some(0) {
            return Err(SandboxError::Runtime(format!(
                "{} {verb} failed: {}",
                self.binary,
                output.stderr_lossy().trim()
            )));
        }
        Ok(output)
    }

    async fn probe(&self) -> bool {
        let mut command = Command::new(&self.binary);
        command.args(["version", "--format", "{{.Server.Version}}"]);
        match run_with_deadline(command, None, PROBE_TIMEOUT, MANAGEMENT_OUTPUT).await {
            Ok(output) if output.exit_code == Some(0) => {
                debug!(
                    "{} server version {}",
                    self.binary,
                    output.stdout_lossy().trim()
                );
                true
            }
            Ok(output) => {
                warn!(
                    "{} is installed but the daemon is unreachable: {}",
                    self.binary,
                    output.stderr_lossy().trim()
                );
                false
            }
            Err(e) => {
                debug!("{} not usable: {e}", self.binary);
                false
            }
        }
    }
}

/// Builds the `docker run` argv for a long-lived, locked-down container.
pub(crate) fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "-w".to_string(),
        spec.workdir.clone(),
    ];

    if !spec.network {
        args.push("--network=none".to_string());
    }
    if let Some(mb) = spec.memory_limit_mb {
        // Same value for swap so the ceiling cannot be dodged by swapping
        args.extend(["--memory".to_string(), format!("{mb}m")]);
        args.extend(["--memory-swap".to_string(), format!("{mb}m")]);
    }
    if let Some(cpus) = spec.cpus {
        args.extend(["--cpus".to_string(), cpus.to_string()]);
    }
    if let Some(pids) = spec.pids_limit {
        args.extend(["--pids-limit".to_string(), pids.to_string()]);
    }
    for (key, value) in &spec.labels {
        args.extend(["--label".to_string(), format!("{key}={value}")]);
    }

    // Keep-alive entrypoint; the image's own entrypoint never runs
    args.extend([
        "--entrypoint".to_string(),
        "tail".to_string(),
        spec.image.clone(),
        "-f".to_string(),
        "/dev/null".to_string(),
    ]);
    args
}

/// Builds the `docker exec` argv for one command.
pub(crate) fn exec_args(container_id: &str, request: &ExecRequest, kill_wrapper: bool) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(ref dir) = request.working_directory {
        args.extend(["-w".to_string(), dir.clone()]);
    }
    for (key, value) in &request.environment {
        args.extend(["-e".to_string(), format!("{key}={value}")]);
    }
    args.push(container_id.to_string());
    if kill_wrapper {
        // Whole seconds, rounded up; the client-side deadline stays exact
        let secs = request.timeout.as_millis().div_ceil(1000).max(1);
        args.extend([
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            secs.to_string(),
        ]);
    }
    args.extend(request.argv.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn is_available(&self) -> bool {
        if let Ok(cache) = self.availability.lock() {
            if let Some((checked_at, available)) = *cache {
                if checked_at.elapsed() < AVAILABILITY_TTL {
                    return available;
                }
            }
        }
        let available = self.probe().await;
        if let Ok(mut cache) = self.availability.lock() {
            *cache = Some((Instant::now(), available));
        }
        available
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.docker(run_args(spec)).await?;
        let id = output.stdout_lossy().trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Runtime(format!(
                "{} run returned no container id",
                self.binary
            )));
        }
        info!("Container {} created from {} ({})", spec.name, spec.image, short_id(&id));
        Ok(id)
    }

    async fn exec(&self, container_id: &str, request: ExecRequest) -> Result<ProcessOutput> {
        let mut command = Command::new(&self.binary);
        command.args(exec_args(container_id, &request, self.kill_wrapper));
        run_with_deadline(command, None, request.timeout, request.max_output)
            .await
            .map_err(|e| SandboxError::Runtime(format!("{} exec: {e}", self.binary)))
    }

    async fn copy_in(
        &self,
        container_id: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        self.docker(vec![
            "cp".to_string(),
            host_path.display().to_string(),
            format!("{container_id}:{container_path}"),
        ])
        .await
        .map_err(|e| SandboxError::Transfer(e.to_string()))?;
        Ok(())
    }

    async fn copy_out(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<()> {
        self.docker(vec![
            "cp".to_string(),
            format!("{container_id}:{container_path}"),
            host_path.display().to_string(),
        ])
        .await
        .map_err(|e| SandboxError::Transfer(e.to_string()))?;
        Ok(())
    }

    async fn oom_killed(&self, container_id: &str) -> Result<bool> {
        let output = self
            .docker(vec![
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.OOMKilled}}".to_string(),
                container_id.to_string(),
            ])
            .await?;
        Ok(output.stdout_lossy().trim() == "true")
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.docker(vec![
            "rm".to_string(),
            "-f".to_string(),
            container_id.to_string(),
        ])
        .await?;
        info!("Container {} removed", short_id(container_id));
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
