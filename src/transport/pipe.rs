//! In-process pipe transport.
//!
//! A pair of channel-backed connections with no failure modes beyond close.
//! Used by tests and by embedders that run a server inside the host process.

use super::{Connection, Frame, Transport};
use crate::error::HostError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct PipeTransport {
    server: String,
    // Taken on close so the peer's frame channel terminates.
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, frame: Frame) -> Result<(), HostError> {
        let closed = HostError::ConnectionClosed {
            server: self.server.clone(),
        };
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| closed),
            None => Err(closed),
        }
    }

    async fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Builds both ends of an in-process connection. The first `Connection` is
/// the host end, the second the server end; frames sent on one arrive in
/// order on the other.
pub fn pair(server: &str) -> (Connection, Connection) {
    let (host_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, host_rx) = mpsc::unbounded_channel();

    let host_end = Connection {
        sink: Arc::new(PipeTransport {
            server: server.to_string(),
            tx: Mutex::new(Some(host_tx)),
        }),
        frames: host_rx,
    };
    let server_end = Connection {
        sink: Arc::new(PipeTransport {
            server: server.to_string(),
            tx: Mutex::new(Some(server_tx)),
        }),
        frames: server_rx,
    };
    (host_end, server_end)
}
