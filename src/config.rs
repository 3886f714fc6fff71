//! Command-line and environment configuration for the server.

use crate::container::ContainerConfig;
use crate::ports::{DEFAULT_RANGE_SIZE, DEFAULT_RANGE_START};
use crate::workspace::Workspace;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3001")]
    pub port: u16,

    /// Root directory for project workspaces [default: ~/.codeblocking/workspaces]
    #[arg(long, env = "WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Origin allowed to make cross-origin requests
    #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:3000")]
    pub frontend_url: String,

    /// Docker daemon socket
    #[arg(long, env = "DOCKER_SOCKET")]
    pub docker_socket: Option<PathBuf>,

    /// Images are named {prefix}/{environment}
    #[arg(long, env = "IMAGE_PREFIX", default_value = "codeblocking")]
    pub image_prefix: String,

    /// First host port handed to containers
    #[arg(long, default_value_t = DEFAULT_RANGE_START)]
    pub port_range_start: u16,

    /// Number of host ports in the pool
    #[arg(long, default_value_t = DEFAULT_RANGE_SIZE)]
    pub port_range_size: u16,

    /// Memory limit per container in MB
    #[arg(long, default_value = "512")]
    pub memory_mb: i64,

    /// Relative CPU weight per container
    #[arg(long, default_value = "256")]
    pub cpu_shares: i64,

    /// Seconds a container gets to stop before it is killed
    #[arg(long, default_value = "5")]
    pub stop_grace_secs: u64,

    /// Seconds allowed for cleanup on shutdown
    #[arg(long, default_value = "15")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub workspace_dir: PathBuf,
    pub frontend_url: String,
    pub docker_socket: Option<PathBuf>,
    pub port_range_start: u16,
    pub port_range_size: u16,
    pub shutdown_timeout: Duration,
    pub container: ContainerConfig,
}

impl From<ServeArgs> for Config {
    fn from(args: ServeArgs) -> Self {
        let container = ContainerConfig {
            image_prefix: args.image_prefix,
            memory_bytes: args.memory_mb.saturating_mul(1024 * 1024),
            cpu_shares: args.cpu_shares,
            stop_grace: Duration::from_secs(args.stop_grace_secs),
            ..ContainerConfig::default()
        };
        Self {
            host: args.host,
            port: args.port,
            workspace_dir: args.workspace_dir.unwrap_or_else(Workspace::default_root),
            frontend_url: args.frontend_url,
            docker_socket: args.docker_socket,
            port_range_start: args.port_range_start,
            port_range_size: args.port_range_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            container,
        }
    }
}
