//! Container runtime seam.
//!
//! The lifecycle and terminal managers only talk to containers through
//! [`ContainerRuntime`]. [`DockerRuntime`] drives a local Docker daemon; tests
//! use the in-memory runtime in `mock`.

mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerRuntime;

use crate::error::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Container-internal port -> host port.
pub type PortMap = BTreeMap<u16, u16>;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    /// Host directory bind-mounted read-write at `mount_point`.
    pub project_path: PathBuf,
    pub mount_point: String,
    pub ports: PortMap,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Missing,
}

/// An interactive command to run inside an existing container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
}

/// Both halves of an attached exec instance.
pub struct ExecIo {
    pub output: BoxStream<'static, Result<Bytes, RuntimeError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    /// Stop with a grace period after which the runtime kills the container.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-remove a container, running or not.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Ids of all containers (any state) carrying `label`.
    async fn list_labeled(&self, label: &str) -> Result<Vec<String>, RuntimeError>;

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec)
        -> Result<String, RuntimeError>;

    async fn start_exec(&self, exec_id: &str) -> Result<ExecIo, RuntimeError>;

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError>;

    /// Exit code of a finished exec, `None` while it is still running.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError>;
}
