//! `ContainerRuntime` trait: abstraction over the container engine.
//!
//! The sessions and the one-shot executor only talk to containers through
//! this trait, so the engine (Docker CLI today) can be swapped and tests can
//! count exactly which calls were made.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::process::ProcessOutput;

/// Everything needed to create a long-lived container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Deterministic, session-scoped container name.
    pub name: String,
    pub image: String,
    /// False means the container gets no network interface at all.
    pub network: bool,
    pub workdir: String,
    pub memory_limit_mb: Option<u32>,
    pub cpus: Option<f64>,
    pub pids_limit: Option<u32>,
    /// Labels attached to the container (owner session id, etc).
    pub labels: BTreeMap<String, String>,
}

/// One command to run inside a running container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Program and arguments; never passed through a host shell.
    pub argv: Vec<String>,
    pub working_directory: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub timeout: Duration,
    pub max_output: usize,
}

impl ExecRequest {
    pub fn new(argv: Vec<String>, timeout: Duration, max_output: usize) -> Self {
        Self {
            argv,
            working_directory: None,
            environment: BTreeMap::new(),
            timeout,
            max_output,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short engine name for logs, e.g. `"docker"`.
    fn name(&self) -> &str;

    /// Whether the engine answers at all. Cheap enough to call per task.
    async fn is_available(&self) -> bool;

    /// Creates and starts a container that idles until removed.
    /// Returns the engine's container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Runs a command inside the container and waits for it (or its deadline).
    async fn exec(&self, container_id: &str, request: ExecRequest) -> Result<ProcessOutput>;

    /// Copies a host file into the container at `container_path`.
    async fn copy_in(&self, container_id: &str, host_path: &Path, container_path: &str)
        -> Result<()>;

    /// Copies `container_path` out of the container to a host file.
    async fn copy_out(&self, container_id: &str, container_path: &str, host_path: &Path)
        -> Result<()>;

    /// Whether the kernel OOM killer fired inside the container.
    async fn oom_killed(&self, container_id: &str) -> Result<bool>;

    /// Force-removes the container (killing whatever still runs in it).
    async fn remove(&self, container_id: &str) -> Result<()>;
}
