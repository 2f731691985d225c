//! Layered execution sandbox for agent-generated code and commands.
//!
//! Every task is screened by the [`policy`] layer, then routed by the
//! [`SandboxCoordinator`] to a container, an isolated script context, or
//! (only when explicitly allowed) a validated host subprocess.

pub mod config;
pub mod error;
pub mod policy;
pub mod sandbox;
pub mod skills;
pub mod task;

pub use config::Config;
pub use error::{Result, SandboxError};
pub use policy::{CommandPolicy, CommandValidator, PolicyStore, Verdict};
pub use sandbox::{ExecutionOptions, SandboxCoordinator};
pub use task::{
    ExecutionResult, ExecutionTask, FailureKind, IsolationTier, ScriptLanguage, TaskKind, TaskSpec,
};
