//! Transport abstractions.
//!
//! A transport is a bidirectional, order-preserving frame channel to one
//! server. The send half is a trait object; the receive half is a channel of
//! frames handed out at connect time. Both concrete variants (local
//! child-process pipe and networked HTTP) satisfy the same contract, so the
//! layers above cannot tell them apart. Ordering is guaranteed per direction
//! within one connection only; distinct servers may answer in any relative
//! order.

use crate::config::ServerConfig;
use crate::error::HostError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod http;
pub mod pipe;
pub mod stdio;

/// One wire frame: a single JSON text.
pub type Frame = String;

/// Send half of a connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queues one frame for in-order delivery to the server. Fails with
    /// `ConnectionClosed` once the connection is closed.
    async fn send(&self, frame: Frame) -> Result<(), HostError>;

    /// Tears the connection down. Idempotent. The inbound frame channel ends
    /// afterwards; it is not restartable.
    async fn close(&self);
}

/// A connected transport: sink plus the inbound frame sequence. The receiver
/// yielding `None` is the terminal close signal, not an error per item.
pub struct Connection {
    pub sink: Arc<dyn Transport>,
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Supported transport backends for configured servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Locally spawned process, newline-delimited frames over stdio.
    Stdio,
    /// Remote server over HTTP; responses arrive as JSON bodies or SSE.
    Http,
}

impl TransportKind {
    /// Resolves the transport backend from config, defaulting to HTTP.
    pub fn from_config(config: &ServerConfig) -> Result<Self, HostError> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "http" | "streamable-http" | "streamable_http" => Ok(TransportKind::Http),
            "stdio" => Ok(TransportKind::Stdio),
            other => Err(HostError::Transport {
                server: config.id.clone(),
                details: format!("unsupported transport: {other}"),
            }),
        }
    }
}

/// Connects to a configured server with whichever backend it declares.
pub async fn connect(config: &ServerConfig) -> Result<Connection, HostError> {
    match TransportKind::from_config(config)? {
        TransportKind::Stdio => stdio::connect(config).await,
        TransportKind::Http => http::connect(config),
    }
}
