//! In-memory [`ContainerRuntime`] used by the container and coordinator tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::runtime::{ContainerRuntime, ContainerSpec, ExecRequest};
use crate::error::{Result, SandboxError};
use crate::sandbox::process::ProcessOutput;

pub(crate) struct FakeRuntime {
    available: bool,
    fail_create: bool,
    oom: bool,
    fail_mkdir: bool,
    created: AtomicUsize,
    removed: AtomicUsize,
    copied_out: AtomicUsize,
    specs: Mutex<Vec<ContainerSpec>>,
    requests: Mutex<Vec<ExecRequest>>,
    responses: Mutex<VecDeque<ProcessOutput>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    links: Mutex<HashMap<String, PathBuf>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            available: true,
            fail_create: false,
            oom: false,
            fail_mkdir: false,
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            copied_out: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            files: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn oom(mut self) -> Self {
        self.oom = true;
        self
    }

    /// Every `mkdir` fails the way it does when the path is a file.
    pub fn failing_mkdir(mut self) -> Self {
        self.fail_mkdir = true;
        self
    }

    /// Queues the output for the next exec that is not housekeeping
    /// (`mkdir`, `stat`, `rm`). Unqueued execs succeed with empty output.
    pub fn respond(&self, output: ProcessOutput) {
        self.responses.lock().unwrap().push_back(output);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.specs.lock().unwrap().last().cloned()
    }

    pub fn exec_requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn copied_out(&self) -> usize {
        self.copied_out.load(Ordering::SeqCst)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Places a file in the container as if the task had written it.
    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    /// Places a symlink in the container; `docker cp` copies it out as a
    /// link to `target`.
    pub fn put_link(&self, path: &str, target: &Path) {
        self.links
            .lock()
            .unwrap()
            .insert(path.to_string(), target.to_path_buf());
    }

    /// Answers the housekeeping commands the session issues itself.
    fn housekeeping(&self, argv: &[String]) -> Option<ProcessOutput> {
        let path = argv.last().map(String::as_str).unwrap_or_default();
        let ok = |stdout: String| ProcessOutput {
            stdout: stdout.into_bytes(),
            exit_code: Some(0),
            ..ProcessOutput::default()
        };
        let failed = |stderr: String| ProcessOutput {
            stderr: stderr.into_bytes(),
            exit_code: Some(1),
            ..ProcessOutput::default()
        };
        match argv.first().map(String::as_str)? {
            "mkdir" if self.fail_mkdir => Some(failed(format!("mkdir: {path}: File exists"))),
            "mkdir" => Some(ok(String::new())),
            "rm" => {
                self.files.lock().unwrap().remove(path);
                Some(ok(String::new()))
            }
            "stat" => {
                let size = self.file(path).map(|content| content.len()).or_else(|| {
                    self.links
                        .lock()
                        .unwrap()
                        .get(path)
                        .map(|target| target.as_os_str().len())
                });
                Some(match size {
                    Some(size) => ok(format!("{size}\n")),
                    None => failed(format!("stat: can't stat '{path}': No such file or directory")),
                })
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_create {
            return Err(SandboxError::Runtime("image pull failed".into()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.specs.lock().unwrap().push(spec.clone());
        Ok(format!("fake-container-{n}"))
    }

    async fn exec(&self, _container_id: &str, request: ExecRequest) -> Result<ProcessOutput> {
        let housekeeping = self.housekeeping(&request.argv);
        self.requests.lock().unwrap().push(request);
        if let Some(output) = housekeeping {
            return Ok(output);
        }
        let queued = self.responses.lock().unwrap().pop_front();
        Ok(queued.unwrap_or(ProcessOutput {
            exit_code: Some(0),
            ..ProcessOutput::default()
        }))
    }

    async fn copy_in(&self, _container_id: &str, host_path: &Path, container_path: &str) -> Result<()> {
        let content = tokio::fs::read(host_path).await?;
        self.files
            .lock()
            .unwrap()
            .insert(container_path.to_string(), content);
        Ok(())
    }

    async fn copy_out(&self, _container_id: &str, container_path: &str, host_path: &Path) -> Result<()> {
        self.copied_out.fetch_add(1, Ordering::SeqCst);
        let link = self.links.lock().unwrap().get(container_path).cloned();
        if let Some(target) = link {
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, host_path)?;
            #[cfg(not(unix))]
            let _ = target;
            return Ok(());
        }
        let content = self
            .file(container_path)
            .ok_or_else(|| SandboxError::Transfer(format!("no such file: {container_path}")))?;
        tokio::fs::write(host_path, content).await?;
        Ok(())
    }

    async fn oom_killed(&self, _container_id: &str) -> Result<bool> {
        Ok(self.oom)
    }

    async fn remove(&self, _container_id: &str) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
