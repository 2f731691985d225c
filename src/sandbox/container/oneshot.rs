//! One-shot container execution: a fresh container per task.
//!
//! Nothing survives between calls. The container is removed on every exit
//! path, including errors; if the future is dropped mid-flight the session's
//! `Drop` schedules the removal instead.

use std::sync::Arc;

use tracing::{debug, warn};

use super::runtime::ContainerRuntime;
use super::session::ContainerSession;
use crate::config::ContainerConfig;
use crate::error::Result;
use crate::task::{ExecutionResult, ExecutionTask};

pub struct ContainerCommandExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    max_output: usize,
}

impl ContainerCommandExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig, max_output: usize) -> Self {
        Self {
            runtime,
            config,
            max_output,
        }
    }

    /// Creates a container, runs `task` in it, and tears it down.
    ///
    /// Errors only for infrastructure problems (container could not be
    /// created or reached); a failing command is a normal result.
    pub async fn execute(&self, task: &ExecutionTask) -> Result<ExecutionResult> {
        let session = ContainerSession::new(self.runtime.clone(), self.config.clone(), self.max_output);
        session.start().await?;
        debug!("Task {} running in one-shot session {}", task.id(), session.id());

        let result = session.run_task(task).await;

        if let Err(e) = session.stop().await {
            warn!("One-shot session {} cleanup failed: {e}", session.id());
        }
        result
    }
}
