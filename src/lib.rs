//! Per-project Docker sandboxes and interactive terminal sessions for a
//! browser IDE.

pub mod config;
pub mod container;
pub mod environment;
pub mod error;
pub mod http_server;
pub mod ports;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod terminal;
pub mod workspace;
