//! Host port pool used for container port bindings.

use crate::error::{Result, SandboxError};
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Mutex;
use tracing::debug;

/// Default first host port handed out.
pub const DEFAULT_RANGE_START: u16 = 3100;
/// Default number of ports in the pool.
pub const DEFAULT_RANGE_SIZE: u16 = 1000;

/// Leases host ports from a fixed range, lowest free port first.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    probe_os: bool,
    leased: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Pool covering `start..start + size`. With `probe_os` set, a port is only
    /// leased if it can be bound on `0.0.0.0` at the time of the scan.
    pub fn new(start: u16, size: u16, probe_os: bool) -> Self {
        let size = size.max(1);
        let end = start.saturating_add(size - 1);
        Self {
            start,
            end,
            probe_os,
            leased: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn acquire(&self) -> Result<u16> {
        let mut leased = self.lock();
        self.acquire_locked(&mut leased)
    }

    /// Lease `count` ports or none of them.
    pub fn acquire_many(&self, count: usize) -> Result<Vec<u16>> {
        let mut leased = self.lock();
        let mut taken = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire_locked(&mut leased) {
                Ok(port) => taken.push(port),
                Err(e) => {
                    for port in &taken {
                        leased.remove(port);
                    }
                    debug!(rolled_back = taken.len(), "port allocation failed");
                    return Err(e);
                }
            }
        }
        Ok(taken)
    }

    /// Returns `true` if the port was leased. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) -> bool {
        self.lock().remove(&port)
    }

    pub fn release_all<I: IntoIterator<Item = u16>>(&self, ports: I) {
        let mut leased = self.lock();
        for port in ports {
            leased.remove(&port);
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    pub fn leased(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }

    pub fn available(&self) -> usize {
        let total = usize::from(self.end - self.start) + 1;
        total - self.lock().len()
    }

    fn acquire_locked(&self, leased: &mut BTreeSet<u16>) -> Result<u16> {
        for port in self.start..=self.end {
            if leased.contains(&port) {
                continue;
            }
            if self.probe_os && !port_is_free(port) {
                debug!(port, "port busy at the OS level, skipping");
                continue;
            }
            leased.insert(port);
            return Ok(port);
        }
        Err(SandboxError::NoPortsAvailable {
            start: self.start,
            end: self.end,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        self.leased.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE_START, DEFAULT_RANGE_SIZE, true)
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
