//! Docker implementation of [`ContainerRuntime`] using bollard.

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, ExecIo, ExecSpec};
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig, PortBinding};
use bollard::query_parameters::{
    ListContainersOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `socket` if given, otherwise to the Docker Desktop socket when
    /// it exists, otherwise to the platform defaults.
    pub fn connect(socket: Option<&Path>) -> Result<Self, RuntimeError> {
        let socket = socket.map(Path::to_path_buf).or_else(desktop_socket);
        let docker = match socket {
            Some(path) => {
                info!(socket = %path.display(), "Connecting to Docker");
                Docker::connect_with_socket(
                    &path.to_string_lossy(),
                    CONNECT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )?
            }
            None => {
                info!("Connecting to Docker with local defaults");
                Docker::connect_with_local_defaults()?
            }
        };
        Ok(Self { docker })
    }
}

fn desktop_socket() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(".docker/desktop/docker.sock");
    path.exists().then_some(path)
}

fn map_not_found(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        other => RuntimeError::Docker(other),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|(container_port, host_port)| {
                let binding = PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                };
                (format!("{}/tcp", container_port), Some(vec![binding]))
            })
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.project_path.display(),
                spec.mount_point
            )]),
            port_bindings: Some(port_bindings),
            memory: Some(spec.memory_bytes),
            cpu_shares: Some(spec.cpu_shares),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            working_dir: Some(spec.mount_point.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self.docker.create_container(None, body).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None)
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        match self.docker.inspect_container(id, None).await {
            Ok(response) => {
                let running = response
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerStatus::Missing),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: Some(i32::try_from(grace.as_secs()).unwrap_or(i32::MAX)),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_not_found(id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn create_exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
    ) -> Result<String, RuntimeError> {
        let config = ExecConfig {
            cmd: Some(spec.cmd.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            working_dir: spec.working_dir.clone(),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, config)
            .await
            .map_err(|e| map_not_found(container_id, e))?;
        Ok(exec.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecIo, RuntimeError> {
        let options = StartExecOptions {
            detach: false,
            tty: true,
            ..Default::default()
        };
        match self.docker.start_exec(exec_id, Some(options)).await {
            Ok(StartExecResults::Attached { output, input }) => {
                let output = output
                    .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(RuntimeError::from))
                    .boxed();
                Ok(ExecIo { output, input })
            }
            Ok(StartExecResults::Detached) => Err(RuntimeError::Other(format!(
                "exec {} started detached",
                exec_id
            ))),
            Err(e) => Err(map_not_found(exec_id, e)),
        }
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError> {
        let options = ResizeExecOptions {
            height: rows,
            width: cols,
        };
        self.docker
            .resize_exec(exec_id, options)
            .await
            .map_err(|e| map_not_found(exec_id, e))
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| map_not_found(exec_id, e))?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }
}
