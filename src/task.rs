//! Task and result types shared by every isolation tier.
//!
//! An [`ExecutionTask`] is immutable once built; an [`ExecutionResult`] is
//! produced exactly once per task and carries the task's id, so correlation
//! survives timeouts and forced kills.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default wall-clock budget when the caller does not set one.
pub const DEFAULT_TIMEOUT_MS: u32 = 30_000;

/// Default advisory memory ceiling for the script tier.
pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 128;

/// Marker appended to stderr when a task is killed at its deadline.
pub const TIMEOUT_MARKER: &str = "[sandbox] execution timed out";

/// Marker appended to stderr when a task breaches its memory ceiling.
pub const MEMORY_MARKER: &str = "[sandbox] memory limit exceeded";

/// Marker appended to a stream that was cut at `max_output_bytes`.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Source code evaluated by an interpreter; never reaches a shell.
    Script,
    /// A program invocation that goes through the command validator first.
    ShellCommand,
}

/// Declared language of a `Script` task.
///
/// Both languages run on the same JavaScript runtime; the value is recorded
/// and logged but does not select a different interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    #[default]
    JavaScript,
    TypeScript,
}

impl ScriptLanguage {
    /// File extension used when a script is materialized inside a container.
    pub fn extension(&self) -> &'static str {
        match self {
            ScriptLanguage::JavaScript => "js",
            ScriptLanguage::TypeScript => "ts",
        }
    }
}

impl std::fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptLanguage::JavaScript => write!(f, "javascript"),
            ScriptLanguage::TypeScript => write!(f, "typescript"),
        }
    }
}

/// A unit of work submitted by the agent's tool layer.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTask {
    id: Uuid,
    kind: TaskKind,
    body: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    environment: BTreeMap<String, String>,
    timeout_ms: u32,
    memory_limit_mb: u32,
    language: ScriptLanguage,
}

impl ExecutionTask {
    /// Starts building a `Script` task from source code.
    pub fn script(body: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(TaskKind::Script, body.into())
    }

    /// Starts building a `ShellCommand` task from a raw command line.
    pub fn command(body: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(TaskKind::ShellCommand, body.into())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Working directory; `None` means the tier's configured default.
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    /// For commands: extra environment variables. For scripts: the
    /// declared input values exposed to the script as `inputs`.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }

    pub fn language(&self) -> ScriptLanguage {
        self.language
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(self.timeout_ms))
    }
}

/// Builder for [`ExecutionTask`]. The task is frozen by [`TaskBuilder::build`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: ExecutionTask,
}

impl TaskBuilder {
    fn new(kind: TaskKind, body: String) -> Self {
        Self {
            task: ExecutionTask {
                id: Uuid::new_v4(),
                kind,
                body,
                args: Vec::new(),
                working_directory: None,
                environment: BTreeMap::new(),
                timeout_ms: DEFAULT_TIMEOUT_MS,
                memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
                language: ScriptLanguage::default(),
            },
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.task.id = id;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.task.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.task.environment.insert(key.into(), value.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.task.timeout_ms = timeout_ms;
        self
    }

    pub fn memory_limit_mb(mut self, memory_limit_mb: u32) -> Self {
        self.task.memory_limit_mb = memory_limit_mb;
        self
    }

    pub fn language(mut self, language: ScriptLanguage) -> Self {
        self.task.language = language;
        self
    }

    pub fn build(self) -> ExecutionTask {
        self.task
    }
}

/// Serializable task description, as received from the CLI or a tool call.
///
/// Missing numeric limits fall back to the caller-supplied defaults in
/// [`TaskSpec::into_task`].
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub kind: TaskKind,
    pub body: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u32>,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub language: ScriptLanguage,
}

impl TaskSpec {
    pub fn into_task(self, default_timeout_ms: u32) -> ExecutionTask {
        let mut builder = TaskBuilder::new(self.kind, self.body)
            .args(self.args)
            .timeout_ms(self.timeout_ms.unwrap_or(default_timeout_ms))
            .memory_limit_mb(self.memory_limit_mb.unwrap_or(DEFAULT_MEMORY_LIMIT_MB))
            .language(self.language);
        if let Some(id) = self.id {
            builder = builder.id(id);
        }
        if let Some(dir) = self.working_directory {
            builder = builder.working_directory(dir);
        }
        for (key, value) in self.environment {
            builder = builder.env(key, value);
        }
        builder.build()
    }
}

/// Which strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationTier {
    /// Separate interpreter context (script tier) or validated host
    /// subprocess (insecure fallback for commands).
    InProcess,
    Container,
    /// Refused by the command validator; nothing ran.
    Rejected,
}

/// Why a task did not succeed. `InfrastructureUnavailable` never appears
/// here: it is raised as a [`SandboxError`](crate::error::SandboxError).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationRejected,
    Timeout,
    ResourceExceeded,
    RuntimeFailure,
}

/// Captured outcome of one tier run, before it is stamped into a result.
#[derive(Debug, Default, Clone)]
pub(crate) struct Outcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub truncated: bool,
}

/// The normalized outcome of a task, whichever tier ran it.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    id: Uuid,
    success: bool,
    stdout: String,
    stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    duration_ms: u32,
    isolation_tier: IsolationTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureKind>,
    truncated: bool,
    timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub(crate) fn from_outcome(
        id: Uuid,
        tier: IsolationTier,
        outcome: Outcome,
        started: Instant,
    ) -> Self {
        Self {
            id,
            success: outcome.failure.is_none(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            duration_ms: elapsed_ms(started),
            isolation_tier: tier,
            failure: outcome.failure,
            truncated: outcome.truncated,
            timestamp: Utc::now(),
        }
    }

    /// Result for a command refused by the validator.
    pub(crate) fn rejected(id: Uuid, reason: &str, started: Instant) -> Self {
        Self::from_outcome(
            id,
            IsolationTier::Rejected,
            Outcome {
                stderr: format!("Command rejected: {reason}"),
                failure: Some(FailureKind::ValidationRejected),
                ..Outcome::default()
            },
            started,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn isolation_tier(&self) -> IsolationTier {
        self.isolation_tier
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

fn elapsed_ms(started: Instant) -> u32 {
    u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX)
}

/// Cuts `text` to at most `max_bytes` on a char boundary and appends the
/// truncation marker. Returns true when something was cut.
pub(crate) fn truncate_output(text: &mut String, max_bytes: usize) -> bool {
    if text.len() <= max_bytes {
        return false;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    true
}
