//! Sandbox error types.
//!
//! Failures of the *sandboxed code* (policy rejection, timeout, memory
//! ceiling, non-zero exit) are never errors: they come back as an
//! [`ExecutionResult`](crate::task::ExecutionResult) with `success = false`
//! and a [`FailureKind`](crate::task::FailureKind). `SandboxError` is reserved
//! for conditions where the sandbox itself cannot do its job.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// No usable isolation tier: the container runtime is unreachable and
    /// insecure fallback was not permitted.
    #[error("Infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),

    /// A container session call was made before `start()` (or after `stop()`).
    #[error("Container session {0} is not started")]
    NotStarted(String),

    /// A lifecycle call was made while the session was in a transient state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Invalid configuration or task (e.g. wrong tier for the task kind).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Copying content across the container boundary failed.
    #[error("File transfer failed: {0}")]
    Transfer(String),

    /// The container runtime or interpreter could not be driven.
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Returns true for conditions that may clear up on their own
    /// (runtime hiccups, I/O), false for misconfiguration and misuse.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SandboxError::Runtime(_) | SandboxError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(SandboxError::Runtime("docker exec failed".into()).is_retriable());
        assert!(SandboxError::Io(std::io::Error::other("boom")).is_retriable());
        assert!(!SandboxError::InfrastructureUnavailable("no docker".into()).is_retriable());
        assert!(!SandboxError::NotStarted("abc".into()).is_retriable());
        assert!(!SandboxError::Config("bad".into()).is_retriable());
    }

    #[test]
    fn test_display_messages() {
        let err = SandboxError::NotStarted("fluux-sandbox-1234".into());
        assert_eq!(
            err.to_string(),
            "Container session fluux-sandbox-1234 is not started"
        );
        let err = SandboxError::InfrastructureUnavailable("docker not found".into());
        assert!(err.to_string().contains("docker not found"));
    }
}
