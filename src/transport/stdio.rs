//! Child-process pipe transport.
//!
//! Spawns the configured command and speaks newline-delimited JSON frames
//! over its stdin/stdout. Stderr is drained so the child never blocks on it.
//! When the child exits or closes stdout, the inbound frame channel ends and
//! the layers above observe the terminal close signal.

use super::{Connection, Frame, Transport};
use crate::config::ServerConfig;
use crate::error::HostError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct StdioTransport {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: Frame) -> Result<(), HostError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| HostError::ConnectionClosed {
            server: self.server.clone(),
        })?;

        let fault = |details: String| HostError::Transport {
            server: self.server.clone(),
            details,
        };
        debug!(server = %self.server, bytes = frame.len(), "writing stdio frame");
        tokio::time::timeout(WRITE_TIMEOUT, stdin.write_all(frame.as_bytes()))
            .await
            .map_err(|_| fault("timed out writing frame".to_string()))?
            .map_err(|err| fault(err.to_string()))?;
        tokio::time::timeout(WRITE_TIMEOUT, stdin.write_all(b"\n"))
            .await
            .map_err(|_| fault("timed out writing frame delimiter".to_string()))?
            .map_err(|err| fault(err.to_string()))?;
        tokio::time::timeout(WRITE_TIMEOUT, stdin.flush())
            .await
            .map_err(|_| fault("timed out flushing frame".to_string()))?
            .map_err(|err| fault(err.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }
    }
}

/// Spawns the configured command and wires its pipes into a connection.
pub async fn connect(config: &ServerConfig) -> Result<Connection, HostError> {
    let server = config.id.clone();
    let fault = |details: String| HostError::Transport {
        server: server.clone(),
        details,
    };

    let command = config
        .command
        .clone()
        .ok_or_else(|| fault("command is required for the stdio transport".to_string()))?;
    let args = config.args.clone().unwrap_or_default();
    debug!(server = %server, command = %command, args = ?args, "spawning stdio server");

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    if let Some(env) = config.env.clone() {
        cmd.envs(env);
    }

    let mut child = cmd.spawn().map_err(|err| fault(err.to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| fault("unable to retrieve child stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| fault("unable to retrieve child stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| fault("unable to retrieve child stderr".to_string()))?;

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    spawn_stdout_reader(server.clone(), stdout, frame_tx);
    spawn_stderr_drain(stderr);

    Ok(Connection {
        sink: Arc::new(StdioTransport {
            server,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
        }),
        frames: frame_rx,
    })
}

fn spawn_stdout_reader(
    server: String,
    stdout: tokio::process::ChildStdout,
    frame_tx: mpsc::UnboundedSender<Frame>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if frame_tx.send(trimmed.to_string()).is_err() {
                break;
            }
        }
        debug!(server = %server, "stdio stdout closed");
        // frame_tx drops here; the receiver sees the terminal close signal.
    });
}

fn spawn_stderr_drain(stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(_)) = reader.next_line().await {}
    });
}
