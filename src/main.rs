//! ide-sandbox - per-project Docker sandboxes with browser terminals.
//!
//! Usage:
//!   ide-sandbox serve [--port 3001]    # Start HTTP/WebSocket server
//!   ide-sandbox cleanup                # Remove leftover sandbox containers

use anyhow::Context;
use clap::{Parser, Subcommand};
use ide_sandbox::config::{Config, ServeArgs};
use ide_sandbox::container::{ContainerConfig, ContainerManager};
use ide_sandbox::http_server;
use ide_sandbox::ports::PortAllocator;
use ide_sandbox::runtime::{ContainerRuntime, DockerRuntime};
use ide_sandbox::state::AppState;
use ide_sandbox::workspace::Workspace;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ide-sandbox")]
#[command(about = "Per-project Docker sandboxes and terminals for a browser IDE")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve(ServeArgs),
    /// Stop and remove every sandbox container, then exit
    Cleanup {
        /// Docker daemon socket
        #[arg(long, env = "DOCKER_SOCKET")]
        docker_socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => serve(serve_args.into()).await,
        Commands::Cleanup { docker_socket } => cleanup(docker_socket).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let workspace = Workspace::new(&config.workspace_dir);
    workspace
        .initialize()
        .await
        .with_context(|| format!("initializing workspace {}", config.workspace_dir.display()))?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(config.docker_socket.as_deref()).context("connecting to Docker")?,
    );
    let ports = Arc::new(PortAllocator::new(
        config.port_range_start,
        config.port_range_size,
        true,
    ));
    let (first_port, last_port) = ports.range();
    info!(first_port, last_port, "Host port pool ready");
    let state = AppState::new(runtime, ports, workspace, config.container.clone());

    let addr = SocketAddr::new(config.host, config.port);
    http_server::run_server(addr, state.clone(), &config.frontend_url, shutdown_signal())
        .await
        .with_context(|| format!("serving on {}", addr))?;

    info!("Server stopped, cleaning up");
    if tokio::time::timeout(config.shutdown_timeout, state.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Cleanup did not finish before the shutdown deadline"
        );
    }
    Ok(())
}

async fn cleanup(docker_socket: Option<PathBuf>) -> anyhow::Result<()> {
    let runtime = DockerRuntime::connect(docker_socket.as_deref()).context("connecting to Docker")?;
    let manager = ContainerManager::new(
        Arc::new(runtime),
        Arc::new(PortAllocator::default()),
        ContainerConfig::default(),
    );
    let report = manager.cleanup_all().await;
    info!(
        removed = report.orphans_removed,
        failed = report.orphan_failures,
        "Sandbox containers cleaned up"
    );
    if report.orphan_failures > 0 {
        anyhow::bail!("{} containers could not be removed", report.orphan_failures);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
