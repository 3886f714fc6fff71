//! In-memory map of live sandbox containers, reconciled against the runtime.

use crate::environment::Environment;
use crate::error::{Result, RuntimeError, SandboxError};
use crate::ports::PortAllocator;
use crate::runtime::{ContainerRuntime, ContainerStatus, PortMap};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// A container is owned by one (user, project) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerKey {
    pub user_id: String,
    pub project_id: String,
}

impl ContainerKey {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.project_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub container_id: String,
    pub environment: Environment,
    pub ports: PortMap,
    pub project_path: PathBuf,
}

pub struct ContainerRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    entries: Mutex<HashMap<ContainerKey, ContainerInfo>>,
}

impl ContainerRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, ports: Arc<PortAllocator>) -> Self {
        Self {
            runtime,
            ports,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Entry for `key` if its container is still running.
    ///
    /// A container that has stopped or disappeared out-of-band is purged here:
    /// its ports go back to the pool and the stopped container is removed.
    pub async fn lookup(&self, key: &ContainerKey) -> Result<Option<ContainerInfo>, RuntimeError> {
        let Some(info) = self.get(key) else {
            return Ok(None);
        };

        match self.runtime.container_status(&info.container_id).await? {
            ContainerStatus::Running => Ok(Some(info)),
            status => {
                info!(
                    key = %key,
                    container_id = %info.container_id,
                    ?status,
                    "Container vanished, purging registry entry"
                );
                if self.purge(key, &info.container_id) && status == ContainerStatus::Stopped {
                    if let Err(e) = self.runtime.remove_container(&info.container_id).await {
                        warn!(container_id = %info.container_id, error = %e, "Failed to remove stopped container");
                    }
                }
                Ok(None)
            }
        }
    }

    /// Entry for `key` without asking the runtime.
    pub fn get(&self, key: &ContainerKey) -> Option<ContainerInfo> {
        self.lock().get(key).cloned()
    }

    pub fn put(&self, key: ContainerKey, info: ContainerInfo) -> Result<()> {
        let mut entries = self.lock();
        let clash = entries
            .iter()
            .any(|(k, v)| k != &key && v.container_id == info.container_id);
        if clash {
            return Err(SandboxError::DuplicateContainer(info.container_id));
        }
        entries.insert(key, info);
        Ok(())
    }

    /// Drop the entry for `key` and hand it back. Ports stay leased; the caller
    /// releases them once the container is gone.
    pub fn remove(&self, key: &ContainerKey) -> Option<ContainerInfo> {
        self.lock().remove(key)
    }

    pub fn keys(&self) -> Vec<ContainerKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn contains_container(&self, container_id: &str) -> bool {
        self.lock().values().any(|v| v.container_id == container_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove `key` only if it still points at `container_id`, releasing its
    /// ports. Returns whether anything was purged.
    fn purge(&self, key: &ContainerKey, container_id: &str) -> bool {
        let removed = {
            let mut entries = self.lock();
            match entries.get(key) {
                Some(current) if current.container_id == container_id => entries.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(info) => {
                self.ports.release_all(info.ports.values().copied());
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContainerKey, ContainerInfo>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
