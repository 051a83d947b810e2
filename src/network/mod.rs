//! Network subsystem for the TCP audio bridges

pub mod mic;
pub mod outbound;
pub mod tcp;

pub use mic::{MicBridgeServer, Rechunker};
pub use outbound::OutboundServer;
pub use tcp::{accept_timeout, bind_listener, configure_stream, resolve_addr};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a bridge server is in its accept/serve cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Listening,
    /// Waiting for the client's header (mic bridge only)
    Handshake,
    /// Sending audio to a client (outbound bridge)
    Serving,
    /// Receiving audio from a client (mic bridge)
    Streaming,
    Stopped,
}

/// Counters shared between a server thread and its supervisor
#[derive(Debug)]
pub struct ServerStats {
    state: Mutex<ServerState>,
    connections: AtomicU64,
    bytes: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::Listening),
            connections: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    /// Clients accepted so far
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// PCM payload bytes moved, excluding headers
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
