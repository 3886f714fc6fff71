//! Shared application state handed to every request handler.

use crate::container::{ContainerConfig, ContainerManager};
use crate::ports::PortAllocator;
use crate::runtime::ContainerRuntime;
use crate::terminal::TerminalManager;
use crate::workspace::Workspace;
use std::sync::Arc;

/// User id used when a client does not identify itself.
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Clone)]
pub struct AppState {
    pub containers: Arc<ContainerManager>,
    pub terminals: Arc<TerminalManager>,
    pub workspace: Arc<Workspace>,
}

impl AppState {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        workspace: Workspace,
        config: ContainerConfig,
    ) -> Self {
        let workspace = Arc::new(workspace);
        let containers = Arc::new(ContainerManager::new(runtime.clone(), ports, config));
        let terminals = Arc::new(TerminalManager::new(
            containers.clone(),
            runtime,
            workspace.clone(),
        ));
        Self {
            containers,
            terminals,
            workspace,
        }
    }

    /// End every terminal, then stop every container.
    pub async fn shutdown(&self) {
        self.terminals.cleanup_all().await;
        let report = self.containers.cleanup_all().await;
        tracing::info!(
            stopped = report.stopped,
            orphans_removed = report.orphans_removed,
            orphan_failures = report.orphan_failures,
            "Cleanup finished"
        );
    }
}
