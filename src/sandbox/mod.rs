//! Execution sandbox: routes each task to the strongest available tier.
//!
//! The layers, outermost first:
//!
//! 1. Command validation: allowlist, blocklist and shell-metacharacter
//!    screening for every `ShellCommand` task, before anything runs
//! 2. Container tier: a persistent session (when the caller names one) or a
//!    throwaway container per task, no network unless configured
//! 3. Insecure fallback, only when explicitly allowed: scripts go to a fresh
//!    interpreter context, commands to a validated argv subprocess
//!
//! When no tier is permitted or reachable the coordinator fails closed with
//! [`SandboxError::InfrastructureUnavailable`] rather than running anything.

pub mod container;
pub mod host;
pub mod process;
pub mod script;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{Config, ContainerConfig, DefaultsConfig, ScriptConfig};
use crate::error::{Result, SandboxError};
use crate::policy::{split_command, CommandValidator, PolicyStore, Verdict};
use crate::task::{ExecutionResult, ExecutionTask, TaskKind};

use container::{
    ContainerCommandExecutor, ContainerHandle, ContainerRuntime, ContainerSession, DockerCli,
};
use host::{HostCommandRunner, HostExecutor};
use script::IsolatedScriptRunner;

/// Per-call routing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Prefer the container tier when the runtime is reachable.
    pub use_container: bool,
    /// Permit the weaker tiers when no container can be used.
    pub allow_insecure_fallback: bool,
    /// Run in the named persistent session instead of a one-shot container.
    pub session: Option<String>,
}

impl ExecutionOptions {
    pub fn from_defaults(defaults: &DefaultsConfig) -> Self {
        Self {
            use_container: defaults.use_container,
            allow_insecure_fallback: defaults.allow_insecure_fallback,
            session: None,
        }
    }

    pub fn in_session(mut self, key: impl Into<String>) -> Self {
        self.session = Some(key.into());
        self
    }
}

pub struct SandboxCoordinator {
    policy: Arc<PolicyStore>,
    runtime: Arc<dyn ContainerRuntime>,
    host: Arc<dyn HostExecutor>,
    container: ContainerConfig,
    script: ScriptConfig,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<ContainerSession>>>,
}

impl SandboxCoordinator {
    /// Coordinator backed by the configured container CLI and the real host.
    pub fn new(config: &Config) -> Self {
        Self::with_components(
            Arc::new(PolicyStore::new(config.policy.clone())),
            Arc::new(DockerCli::new(&config.container)),
            Arc::new(HostCommandRunner::new(config.host.clone())),
            config.container.clone(),
            config.script.clone(),
        )
    }

    pub fn with_components(
        policy: Arc<PolicyStore>,
        runtime: Arc<dyn ContainerRuntime>,
        host: Arc<dyn HostExecutor>,
        container: ContainerConfig,
        script: ScriptConfig,
    ) -> Self {
        Self {
            policy,
            runtime,
            host,
            container,
            script,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Validates, routes and runs one task.
    ///
    /// Task-level failures (rejection, timeout, memory, non-zero exit) come
    /// back as an unsuccessful [`ExecutionResult`]. `Err` means no tier could
    /// run the task at all.
    pub async fn execute(
        &self,
        task: &ExecutionTask,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let policy = self.policy.snapshot();
        let max_output = policy.max_output_bytes();

        // Scripts never reach a shell, so only commands are screened
        let command = match task.kind() {
            TaskKind::Script => None,
            TaskKind::ShellCommand => {
                let validator = CommandValidator::new(policy.clone());
                if let Verdict::Blocked(reason) = validator.validate(task.body(), task.args()) {
                    warn!("Task {} rejected: {reason}", task.id());
                    return Ok(ExecutionResult::rejected(
                        task.id(),
                        &reason.to_string(),
                        started,
                    ));
                }
                match split_command(task.body()) {
                    Ok(parsed) => Some(parsed),
                    Err(reason) => {
                        warn!("Task {} rejected: {reason}", task.id());
                        return Ok(ExecutionResult::rejected(
                            task.id(),
                            &reason.to_string(),
                            started,
                        ));
                    }
                }
            }
        };

        if options.use_container {
            if self.runtime.is_available().await {
                return match &options.session {
                    Some(key) => {
                        let session = self.session(key).await;
                        session.start().await?;
                        info!(
                            "Task {} → container session {key} ({:?})",
                            task.id(),
                            task.kind()
                        );
                        session.run_task(task).await
                    }
                    None => {
                        info!("Task {} → one-shot container ({:?})", task.id(), task.kind());
                        ContainerCommandExecutor::new(
                            self.runtime.clone(),
                            self.container.clone(),
                            max_output,
                        )
                        .execute(task)
                        .await
                    }
                };
            }
            warn!("Container runtime '{}' is not reachable", self.runtime.name());
        }

        if !options.allow_insecure_fallback {
            return Err(SandboxError::InfrastructureUnavailable(format!(
                "no permitted isolation tier for task {} (container {}, insecure fallback disabled)",
                task.id(),
                if options.use_container { "unreachable" } else { "not requested" }
            )));
        }

        match command {
            Some(parsed) => {
                warn!("Task {} → host subprocess (insecure fallback)", task.id());
                self.host.run(task, &parsed, max_output).await
            }
            None => {
                info!("Task {} → isolated script context", task.id());
                IsolatedScriptRunner::new(&self.script, max_output)
                    .run(task)
                    .await
            }
        }
    }

    /// The session registered under `key`, created (not started) on first use.
    pub async fn session(&self, key: &str) -> Arc<ContainerSession> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("Registering container session {key}");
                let policy = self.policy.snapshot();
                Arc::new(
                    ContainerSession::new(
                        self.runtime.clone(),
                        self.container.clone(),
                        policy.max_output_bytes(),
                    )
                    .with_default_timeout(policy.default_timeout()),
                )
            })
            .clone()
    }

    /// Handle of a running session, if any.
    pub async fn session_handle(&self, key: &str) -> Option<ContainerHandle> {
        let sessions = self.sessions.lock().await;
        sessions.get(key).and_then(|session| session.handle())
    }

    /// Stops and forgets a session. Returns false when no such session exists.
    pub async fn close_session(&self, key: &str) -> Result<bool> {
        let session = self.sessions.lock().await.remove(key);
        match session {
            Some(session) => {
                session.stop().await?;
                info!("Closed container session {key}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops every registered session.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Arc<ContainerSession>)> =
            self.sessions.lock().await.drain().collect();
        if sessions.is_empty() {
            return;
        }
        info!("Stopping {} container session(s)", sessions.len());
        let stops = sessions.iter().map(|(key, session)| async move {
            if let Err(e) = session.stop().await {
                warn!("Failed to stop session {key}: {e}");
            }
        });
        futures::future::join_all(stops).await;
    }
}
