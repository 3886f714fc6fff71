//! Error types for the runtime adapter and the sandbox managers.

use thiserror::Error;

/// Errors reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no such container or exec: {0}")]
    NotFound(String),

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::NotFound(_)
                | RuntimeError::Docker(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                })
        )
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no host ports available in {start}..={end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("failed to create container: {0}")]
    ContainerCreateFailed(#[source] RuntimeError),

    #[error("container {0} is already registered under another project")]
    DuplicateContainer(String),

    #[error("failed to open terminal: {0}")]
    ExecFailed(#[source] RuntimeError),

    #[error("terminal stream error: {0}")]
    Stream(String),

    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),

    #[error("workspace: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("git: {0}")]
    Git(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
