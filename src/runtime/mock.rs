//! In-memory runtime for tests. Exec instances echo their input back like a
//! tty and end when their input is closed.

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, ExecIo, ExecSpec};
use crate::error::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify};

struct AttachedOutput {
    tx: mpsc::WeakUnboundedSender<Result<Bytes, RuntimeError>>,
    stop: Arc<Notify>,
}

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub spec: ContainerSpec,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone)]
pub struct MockExec {
    pub container_id: String,
    pub spec: ExecSpec,
    pub resizes: Vec<(u16, u16)>,
    pub exit_code: Option<i64>,
}

#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    execs: Mutex<HashMap<String, MockExec>>,
    outputs: Mutex<HashMap<String, AttachedOutput>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    stops: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_exec: AtomicBool,
    pub fail_resize: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn exec(&self, id: &str) -> Option<MockExec> {
        self.execs.lock().unwrap().get(id).cloned()
    }

    pub fn exec_ids(&self) -> Vec<String> {
        self.execs.lock().unwrap().keys().cloned().collect()
    }

    /// Simulate the container dying out-of-band. Shells running in it are
    /// killed with it, so their output streams end with exit code 137.
    pub fn kill(&self, id: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.status = ContainerStatus::Stopped;
        }
        let killed: Vec<String> = self
            .execs
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|(_, exec)| exec.container_id == id && exec.exit_code.is_none())
            .map(|(exec_id, exec)| {
                exec.exit_code = Some(137);
                exec_id.clone()
            })
            .collect();
        let mut outputs = self.outputs.lock().unwrap();
        for exec_id in killed {
            if let Some(attached) = outputs.remove(&exec_id) {
                attached.stop.notify_one();
            }
        }
    }

    /// Insert a container this runtime did not create, as a previous process
    /// would have left behind.
    pub fn insert_orphan(&self, labels: HashMap<String, String>) -> String {
        let id = self.fresh_id("orphan");
        let spec = ContainerSpec {
            image: "orphan".into(),
            cmd: vec![],
            project_path: "/tmp".into(),
            mount_point: "/workspace".into(),
            ports: Default::default(),
            memory_bytes: 0,
            cpu_shares: 0,
            labels,
        };
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                spec,
                status: ContainerStatus::Running,
            },
        );
        id
    }

    /// Push an error into an attached exec's output stream.
    pub fn break_exec(&self, exec_id: &str, message: &str) {
        if let Some(attached) = self.outputs.lock().unwrap().remove(exec_id) {
            if let Some(tx) = attached.tx.upgrade() {
                let _ = tx.send(Err(RuntimeError::Other(message.to_string())));
            }
            attached.stop.notify_one();
        }
    }

    /// End an exec's output stream as if the shell exited with `code`.
    pub fn finish_exec(&self, exec_id: &str, code: i64) {
        if let Some(exec) = self.execs.lock().unwrap().get_mut(exec_id) {
            exec.exit_code = Some(code);
        }
        if let Some(attached) = self.outputs.lock().unwrap().remove(exec_id) {
            attached.stop.notify_one();
        }
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n:04}")
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("image not found".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = self.fresh_id("ctr");
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                status: ContainerStatus::Stopped,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("bind mount failed".into()));
        }
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.status = ContainerStatus::Running;
        Ok(())
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.status)
            .unwrap_or(ContainerStatus::Missing))
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("daemon unavailable".into()));
        }
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.status = ContainerStatus::Stopped;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("daemon unavailable".into()));
        }
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.spec.labels.contains_key(label))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn create_exec(
        &self,
        container_id: &str,
        spec: &ExecSpec,
    ) -> Result<String, RuntimeError> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("exec create refused".into()));
        }
        match self.containers.lock().unwrap().get(container_id) {
            Some(c) if c.status == ContainerStatus::Running => {}
            _ => return Err(RuntimeError::NotFound(container_id.to_string())),
        }
        let id = self.fresh_id("exec");
        self.execs.lock().unwrap().insert(
            id.clone(),
            MockExec {
                container_id: container_id.to_string(),
                spec: spec.clone(),
                resizes: Vec::new(),
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecIo, RuntimeError> {
        if !self.execs.lock().unwrap().contains_key(exec_id) {
            return Err(RuntimeError::NotFound(exec_id.to_string()));
        }
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        self.outputs.lock().unwrap().insert(
            exec_id.to_string(),
            AttachedOutput {
                tx: tx.downgrade(),
                stop: stop.clone(),
            },
        );

        // Echo loop: whatever the client writes comes back as output. The
        // output stream ends once this task drops `tx`.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    read = server.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                                break;
                            }
                        }
                    },
                }
            }
        });

        let output = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(ExecIo {
            output,
            input: Box::pin(client),
        })
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError> {
        if self.fail_resize.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("resize refused".into()));
        }
        let mut execs = self.execs.lock().unwrap();
        let exec = execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))?;
        exec.resizes.push((cols, rows));
        Ok(())
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        Ok(self
            .execs
            .lock()
            .unwrap()
            .get(exec_id)
            .and_then(|e| e.exit_code))
    }
}
