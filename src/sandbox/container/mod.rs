//! Container tier: persistent sessions and one-shot executions.

pub mod docker;
pub mod oneshot;
pub mod runtime;
pub mod session;

pub use docker::DockerCli;
pub use oneshot::ContainerCommandExecutor;
pub use runtime::{ContainerRuntime, ContainerSpec, ExecRequest};
pub use session::{ContainerHandle, ContainerSession, SessionState};

#[cfg(test)]
pub(crate) mod testing;
