//! Container lifecycle: one sandbox per (user, project), created on demand,
//! stopped on request or at shutdown.

use crate::environment::Environment;
use crate::error::{Result, SandboxError};
use crate::ports::PortAllocator;
use crate::registry::{ContainerInfo, ContainerKey, ContainerRegistry};
use crate::runtime::{ContainerRuntime, ContainerSpec, PortMap};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

pub const LABEL_USER_ID: &str = "ide-sandbox.user-id";
pub const LABEL_PROJECT_ID: &str = "ide-sandbox.project-id";

/// Container ports forwarded to the host, for dev servers started in the sandbox.
pub const CONTAINER_PORTS: std::ops::RangeInclusive<u16> = 3000..=3010;

const ORPHAN_STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image_prefix: String,
    pub shell: Vec<String>,
    pub mount_point: String,
    pub memory_bytes: i64,
    /// Relative CPU weight; 1024 is one full core.
    pub cpu_shares: i64,
    pub stop_grace: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image_prefix: "codeblocking".to_string(),
            shell: vec!["/bin/bash".to_string()],
            mount_point: "/workspace".to_string(),
            memory_bytes: 512 * 1024 * 1024,
            cpu_shares: 256,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Outcome of [`ContainerManager::cleanup_all`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub stopped: usize,
    pub orphans_removed: usize,
    pub orphan_failures: usize,
}

/// One async mutex per key, dropped again once nobody holds or waits on it.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<ContainerKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &ContainerKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn prune(&self, key: &ContainerKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    registry: ContainerRegistry,
    inflight: KeyedLocks,
    config: ContainerConfig,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        config: ContainerConfig,
    ) -> Self {
        let registry = ContainerRegistry::new(runtime.clone(), ports.clone());
        Self {
            runtime,
            ports,
            registry,
            inflight: KeyedLocks::default(),
            config,
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Running container for `key`, created if there is none.
    ///
    /// Calls for the same key are serialized: a caller arriving while another
    /// is creating waits and then reuses that container.
    pub async fn ensure_container(
        &self,
        key: &ContainerKey,
        environment: Environment,
        project_path: &Path,
    ) -> Result<ContainerInfo> {
        let guard = self.inflight.lock(key).await;
        let result = self.ensure_locked(key, environment, project_path).await;
        drop(guard);
        self.inflight.prune(key);
        result
    }

    async fn ensure_locked(
        &self,
        key: &ContainerKey,
        environment: Environment,
        project_path: &Path,
    ) -> Result<ContainerInfo> {
        if let Some(existing) = self.registry.lookup(key).await? {
            return Ok(existing);
        }

        tokio::fs::create_dir_all(project_path).await?;
        let project_path = tokio::fs::canonicalize(project_path).await?;

        let host_ports = self.ports.acquire_many(CONTAINER_PORTS.count())?;
        let ports: PortMap = CONTAINER_PORTS.zip(host_ports).collect();

        let spec = ContainerSpec {
            image: environment.image(&self.config.image_prefix),
            cmd: self.config.shell.clone(),
            project_path: project_path.clone(),
            mount_point: self.config.mount_point.clone(),
            ports: ports.clone(),
            memory_bytes: self.config.memory_bytes,
            cpu_shares: self.config.cpu_shares,
            labels: HashMap::from([
                (LABEL_USER_ID.to_string(), key.user_id.clone()),
                (LABEL_PROJECT_ID.to_string(), key.project_id.clone()),
            ]),
        };

        let container_id = match self.create_and_start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.ports.release_all(ports.values().copied());
                warn!(key = %key, image = %spec.image, error = %e, "Container creation failed, ports released");
                return Err(e);
            }
        };

        let info = ContainerInfo {
            container_id,
            environment,
            ports,
            project_path,
        };
        if let Err(e) = self.registry.put(key.clone(), info.clone()) {
            self.discard(&info).await;
            return Err(e);
        }

        info!(
            key = %key,
            container_id = %short_id(&info.container_id),
            image = %spec.image,
            "Container started"
        );
        Ok(info)
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self
            .runtime
            .create_container(spec)
            .await
            .map_err(SandboxError::ContainerCreateFailed)?;
        if let Err(e) = self.runtime.start_container(&id).await {
            if let Err(rm) = self.runtime.remove_container(&id).await {
                warn!(container_id = %short_id(&id), error = %rm, "Failed to remove unstarted container");
            }
            return Err(SandboxError::ContainerCreateFailed(e));
        }
        Ok(id)
    }

    /// Stop and remove the container for `key`. A no-op when there is none;
    /// runtime failures are logged and the ports and registry entry are
    /// reclaimed regardless.
    pub async fn stop_container(&self, key: &ContainerKey) {
        let guard = self.inflight.lock(key).await;
        if let Some(info) = self.registry.remove(key) {
            self.discard(&info).await;
            info!(key = %key, container_id = %short_id(&info.container_id), "Container stopped");
        }
        drop(guard);
        self.inflight.prune(key);
    }

    async fn discard(&self, info: &ContainerInfo) {
        let id = &info.container_id;
        match self.runtime.stop_container(id, self.config.stop_grace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(container_id = %short_id(id), "Container already gone"),
            Err(e) => warn!(container_id = %short_id(id), error = %e, "Failed to stop container"),
        }
        match self.runtime.remove_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container_id = %short_id(id), error = %e, "Failed to remove container"),
        }
        self.ports.release_all(info.ports.values().copied());
    }

    /// Stop every tracked container, then remove labelled containers this
    /// process does not track (left over from an earlier run).
    pub async fn cleanup_all(&self) -> CleanupReport {
        info!("Cleaning up all containers");
        let mut report = CleanupReport::default();

        for key in self.registry.keys() {
            self.stop_container(&key).await;
            report.stopped += 1;
        }

        let orphans = match self.runtime.list_labeled(LABEL_USER_ID).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list sandbox containers");
                return report;
            }
        };

        for id in orphans {
            if self.registry.contains_container(&id) {
                continue;
            }
            if let Err(e) = self.runtime.stop_container(&id, ORPHAN_STOP_GRACE).await {
                warn!(container_id = %short_id(&id), error = %e, "Failed to stop orphaned container");
            }
            match self.runtime.remove_container(&id).await {
                Ok(()) => {
                    info!(container_id = %short_id(&id), "Cleaned up orphaned container");
                    report.orphans_removed += 1;
                }
                Err(e) => {
                    warn!(container_id = %short_id(&id), error = %e, "Failed to remove orphaned container");
                    report.orphan_failures += 1;
                }
            }
        }

        report
    }

    pub fn get_ports(&self, key: &ContainerKey) -> Option<PortMap> {
        self.registry.get(key).map(|info| info.ports)
    }

    pub fn container_count(&self) -> usize {
        self.registry.len()
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
