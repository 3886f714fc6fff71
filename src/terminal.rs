//! Interactive shells inside project containers, one per client socket.
//!
//! Each session owns an exec instance and two pump tasks: input from the socket
//! goes through a channel to the exec's stdin, output from the exec is decoded
//! and emitted to the socket. Every way a session can end (stream end, stream
//! error, disconnect, replacement, shutdown) goes through
//! [`TerminalManager::close_session`]; removing the entry from the session
//! table decides which caller performs the teardown.

use crate::container::{short_id, ContainerManager};
use crate::environment::Environment;
use crate::error::{Result, RuntimeError, SandboxError};
use crate::protocol::{ServerEvent, SocketHandle, SocketId};
use crate::registry::ContainerKey;
use crate::runtime::{ContainerRuntime, ExecSpec};
use crate::workspace::Workspace;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Attaching,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Attached,
    End,
    Error,
    Disconnect,
    Shutdown,
    TornDown,
}

impl SessionState {
    pub fn on(self, event: SessionEvent) -> SessionState {
        use SessionEvent::*;
        use SessionState::*;
        match (self, event) {
            (Attaching, Attached) => Open,
            (Attaching | Open, End | Error | Disconnect | Shutdown) => Closing,
            (Closing, TornDown) => Closed,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseReason {
    StreamEnded,
    StreamError(String),
    Disconnected,
    Replaced,
    Shutdown,
}

impl CloseReason {
    fn event(&self) -> SessionEvent {
        match self {
            CloseReason::StreamEnded => SessionEvent::End,
            CloseReason::StreamError(_) => SessionEvent::Error,
            CloseReason::Disconnected | CloseReason::Replaced => SessionEvent::Disconnect,
            CloseReason::Shutdown => SessionEvent::Shutdown,
        }
    }
}

struct TerminalSession {
    id: Uuid,
    owner: ContainerKey,
    container_id: String,
    exec_id: String,
    socket: SocketHandle,
    state: SessionState,
    input: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

pub struct TerminalManager {
    containers: Arc<ContainerManager>,
    runtime: Arc<dyn ContainerRuntime>,
    workspace: Arc<Workspace>,
    sessions: Mutex<HashMap<SocketId, TerminalSession>>,
}

impl TerminalManager {
    pub fn new(
        containers: Arc<ContainerManager>,
        runtime: Arc<dyn ContainerRuntime>,
        workspace: Arc<Workspace>,
    ) -> Self {
        Self {
            containers,
            runtime,
            workspace,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a shell for `socket` in the container of (`user_id`, `project_id`),
    /// spawning the container if needed. Failures are reported to the socket
    /// as `terminal:error` and returned.
    pub async fn on_create(
        self: &Arc<Self>,
        socket: &SocketHandle,
        user_id: &str,
        project_id: &str,
        environment: Option<&str>,
    ) -> Result<()> {
        if project_id.trim().is_empty() {
            socket.emit(ServerEvent::Error {
                message: "Project ID required".to_string(),
            });
            return Err(SandboxError::InvalidProjectId(project_id.to_string()));
        }

        match self.open(socket, user_id, project_id, environment).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(socket_id = %socket.id(), user_id, project_id, error = %e, "Error creating terminal");
                socket.emit(ServerEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn open(
        self: &Arc<Self>,
        socket: &SocketHandle,
        user_id: &str,
        project_id: &str,
        environment: Option<&str>,
    ) -> Result<()> {
        let key = ContainerKey::new(user_id, project_id);
        let path = self.workspace.project_path(user_id, project_id)?;
        let path = self.workspace.ensure_project_dir(&path).await?;
        let environment = match environment {
            Some(name) => Environment::from_name(name),
            None => Environment::detect(&path),
        };

        let info = self
            .containers
            .ensure_container(&key, environment, &path)
            .await?;

        let config = self.containers.config();
        let exec_spec = ExecSpec {
            cmd: config.shell.clone(),
            working_dir: Some(config.mount_point.clone()),
            tty: true,
        };
        let exec_id = self
            .runtime
            .create_exec(&info.container_id, &exec_spec)
            .await
            .map_err(SandboxError::ExecFailed)?;
        let io = self
            .runtime
            .start_exec(&exec_id)
            .await
            .map_err(SandboxError::ExecFailed)?;

        self.close_session(socket.id(), None, CloseReason::Replaced)
            .await;

        let session_id = Uuid::new_v4();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(pump_input(io.input, input_rx));

        let session = TerminalSession {
            id: session_id,
            owner: key.clone(),
            container_id: info.container_id.clone(),
            exec_id: exec_id.clone(),
            socket: socket.clone(),
            state: SessionState::Attaching,
            input: Some(input_tx),
            reader: None,
            writer: Some(writer),
        };
        self.lock().insert(socket.id(), session);

        socket.emit(ServerEvent::Ready {
            ports: info.ports.clone(),
        });

        let reader = tokio::spawn(self.clone().pump_output(
            socket.clone(),
            session_id,
            io.output,
        ));
        match self.lock().get_mut(&socket.id()) {
            Some(session) if session.id == session_id => {
                session.reader = Some(reader);
                session.state = session.state.on(SessionEvent::Attached);
            }
            // Closed while attaching.
            _ => reader.abort(),
        }

        info!(
            socket_id = %socket.id(),
            key = %key,
            container_id = %short_id(&info.container_id),
            exec_id = %short_id(&exec_id),
            "Terminal created"
        );
        Ok(())
    }

    /// Forward `data` verbatim to the socket's shell. Dropped when the socket
    /// has no terminal.
    pub fn on_input(&self, socket_id: SocketId, data: &str) {
        let sessions = self.lock();
        let Some(session) = sessions.get(&socket_id) else {
            debug!(%socket_id, "Input for socket without terminal dropped");
            return;
        };
        if session.state != SessionState::Open {
            debug!(%socket_id, state = ?session.state, "Input for terminal that is not open dropped");
            return;
        }
        if let Some(input) = &session.input {
            let _ = input.send(Bytes::copy_from_slice(data.as_bytes()));
        }
    }

    pub async fn on_resize(&self, socket_id: SocketId, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            debug!(%socket_id, cols, rows, "Ignoring empty terminal size");
            return;
        }
        let exec_id = match self.lock().get(&socket_id) {
            Some(session) => session.exec_id.clone(),
            None => return,
        };
        if let Err(e) = self.runtime.resize_exec(&exec_id, cols, rows).await {
            warn!(%socket_id, exec_id = %short_id(&exec_id), error = %e, "Error resizing terminal");
        }
    }

    /// End the socket's terminal. The container keeps running for later
    /// sessions.
    pub async fn on_disconnect(&self, socket_id: SocketId) {
        if self
            .close_session(socket_id, None, CloseReason::Disconnected)
            .await
        {
            info!(%socket_id, "Terminal disconnected");
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.lock().len()
    }

    /// End every session and wait for their input streams to close.
    pub async fn cleanup_all(&self) {
        let drained: Vec<TerminalSession> = self.lock().drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }
        info!(sessions = drained.len(), "Closing all terminals");

        let mut writers = Vec::new();
        for mut session in drained {
            session.state = session.state.on(SessionEvent::Shutdown);
            if let Some(writer) = self.teardown(&mut session, &CloseReason::Shutdown).await {
                writers.push(writer);
            }
            session.state = session.state.on(SessionEvent::TornDown);
        }
        for writer in writers {
            let _ = writer.await;
        }
    }

    /// Remove the socket's session (only `session_id`, when given) and tear it
    /// down. Returns whether this call performed the teardown.
    async fn close_session(
        &self,
        socket_id: SocketId,
        session_id: Option<Uuid>,
        reason: CloseReason,
    ) -> bool {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(&socket_id) {
                Some(s) if session_id.map_or(true, |id| id == s.id) => sessions.remove(&socket_id),
                _ => None,
            }
        };
        let Some(mut session) = removed else {
            return false;
        };

        let from = session.state;
        session.state = session.state.on(reason.event());
        debug!(
            %socket_id,
            key = %session.owner,
            ?from,
            container_id = %short_id(&session.container_id),
            ?reason,
            "Closing terminal session"
        );
        self.teardown(&mut session, &reason).await;
        session.state = session.state.on(SessionEvent::TornDown);
        debug_assert_eq!(session.state, SessionState::Closed);
        true
    }

    /// Release a session's stream. Hands back the input pump so shutdown can
    /// wait for stdin to be closed.
    async fn teardown(
        &self,
        session: &mut TerminalSession,
        reason: &CloseReason,
    ) -> Option<JoinHandle<()>> {
        // Dropping the sender lets the input pump shut the exec's stdin.
        drop(session.input.take());

        match reason {
            CloseReason::StreamEnded => {
                let exit_code = match self.runtime.exec_exit_code(&session.exec_id).await {
                    Ok(code) => code.unwrap_or(0),
                    Err(e) => {
                        debug!(exec_id = %short_id(&session.exec_id), error = %e, "Exit code unavailable");
                        0
                    }
                };
                session.socket.emit(ServerEvent::Exit { exit_code });
            }
            CloseReason::StreamError(message) => {
                warn!(socket_id = %session.socket.id(), error = %message, "Terminal stream error");
                session.socket.emit(ServerEvent::Error {
                    message: message.clone(),
                });
            }
            CloseReason::Disconnected | CloseReason::Replaced | CloseReason::Shutdown => {
                if let Some(reader) = session.reader.take() {
                    reader.abort();
                }
            }
        }

        session.writer.take()
    }

    async fn pump_output(
        self: Arc<Self>,
        socket: SocketHandle,
        session_id: Uuid,
        mut output: BoxStream<'static, std::result::Result<Bytes, RuntimeError>>,
    ) {
        let mut decoder = Utf8Decoder::default();
        let reason = loop {
            match output.next().await {
                Some(Ok(chunk)) => {
                    let data = decoder.push(&chunk);
                    if !data.is_empty() {
                        socket.emit(ServerEvent::Output { data });
                    }
                }
                Some(Err(e)) => {
                    break CloseReason::StreamError(SandboxError::Stream(e.to_string()).to_string())
                }
                None => break CloseReason::StreamEnded,
            }
        };

        let rest = decoder.finish();
        if !rest.is_empty() {
            socket.emit(ServerEvent::Output { data: rest });
        }
        self.close_session(socket.id(), Some(session_id), reason)
            .await;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketId, TerminalSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn pump_input(
    mut input: Pin<Box<dyn AsyncWrite + Send>>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = input.write_all(&chunk).await {
            debug!(error = %e, "Terminal input closed");
            break;
        }
        if let Err(e) = input.flush().await {
            debug!(error = %e, "Terminal input flush failed");
            break;
        }
    }
    let _ = input.shutdown().await;
}

/// Decodes a byte stream as UTF-8, holding back a multi-byte sequence that is
/// split across chunks until the rest arrives.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
impl TerminalManager {
    fn session_exec(&self, socket_id: SocketId) -> Option<(String, String)> {
        self.lock()
            .get(&socket_id)
            .map(|s| (s.container_id.clone(), s.exec_id.clone()))
    }

    fn session_state(&self, socket_id: SocketId) -> Option<SessionState> {
        self.lock().get(&socket_id).map(|s| s.state)
    }
}
