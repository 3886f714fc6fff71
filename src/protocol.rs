//! Terminal socket messages and the per-connection outbound handle.

use crate::runtime::PortMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Messages sent by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "terminal:create")]
    Create {
        #[serde(rename = "projectId", default)]
        project_id: String,
        #[serde(default)]
        environment: Option<String>,
    },
    #[serde(rename = "terminal:input")]
    Input { data: String },
    #[serde(rename = "terminal:resize")]
    Resize { cols: u16, rows: u16 },
}

/// Messages sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "terminal:ready")]
    Ready { ports: PortMap },
    #[serde(rename = "terminal:output")]
    Output { data: String },
    #[serde(rename = "terminal:exit")]
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i64,
    },
    #[serde(rename = "terminal:error")]
    Error { message: String },
}

pub type SocketId = Uuid;

/// Outbound side of one client connection. Emitting after the connection has
/// gone away is silently ignored.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SocketId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl SocketHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
