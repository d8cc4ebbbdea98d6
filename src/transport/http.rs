//! Networked transport.
//!
//! Each outbound frame is POSTed to the server's base URL. The server answers
//! with either a plain JSON body or a `text/event-stream` body; both are
//! decomposed into inbound frames on the same channel the local transports
//! use, so the session layer never learns which backend carried them.

use super::{Connection, Frame, Transport};
use crate::config::ServerConfig;
use crate::error::HostError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

fn build_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(HTTP_REQUEST_TIMEOUT)
        .pool_idle_timeout(HTTP_POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| err.to_string())
}

fn is_event_stream_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .map(|media| media.trim().eq_ignore_ascii_case("text/event-stream"))
        .unwrap_or(false)
}

/// Reassembles SSE lines from arbitrarily chunked response bodies. Bytes
/// that are not valid UTF-8 are decoded lossily rather than dropped, so a
/// stray byte cannot make a whole data line vanish.
#[derive(Default)]
struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(newline_index) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=newline_index).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            lines.extend(decode_sse_line(&raw));
        }
        if flush {
            let rest = std::mem::take(&mut self.buffer);
            lines.extend(decode_sse_line(&rest));
        }
        lines
    }
}

fn decode_sse_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn sse_data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

struct HttpTransport {
    server: String,
    base_url: String,
    client: reqwest::Client,
    // Taken on close; inbound frames stop flowing afterwards.
    frame_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl HttpTransport {
    fn frame_sender(&self) -> Result<mpsc::UnboundedSender<Frame>, HostError> {
        self.frame_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| HostError::ConnectionClosed {
                server: self.server.clone(),
            })
    }

    fn fault(&self, details: String) -> HostError {
        HostError::Transport {
            server: self.server.clone(),
            details,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, frame: Frame) -> Result<(), HostError> {
        let frame_tx = self.frame_sender()?;

        debug!(server = %self.server, bytes = frame.len(), "posting frame");
        let response = self
            .client
            .post(&self.base_url)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT)
            .body(frame)
            .send()
            .await
            .map_err(|err| self.fault(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.fault(format!("server answered HTTP {status}")));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if is_event_stream_content_type(&content_type) {
            let mut buffer = SseLineBuffer::default();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|err| self.fault(err.to_string()))?;
                for line in buffer.push(&chunk) {
                    if let Some(payload) = sse_data_payload(&line) {
                        let _ = frame_tx.send(payload.to_string());
                    }
                }
            }
            for line in buffer.finish() {
                if let Some(payload) = sse_data_payload(&line) {
                    let _ = frame_tx.send(payload.to_string());
                }
            }
        } else {
            let body = response
                .text()
                .await
                .map_err(|err| self.fault(err.to_string()))?;
            let trimmed = body.trim();
            if !trimmed.is_empty() {
                let _ = frame_tx.send(trimmed.to_string());
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.frame_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Builds an HTTP-backed connection to a configured server.
pub fn connect(config: &ServerConfig) -> Result<Connection, HostError> {
    let server = config.id.clone();
    let base_url = config.base_url.clone().ok_or_else(|| HostError::Transport {
        server: server.clone(),
        details: "base_url is required for the http transport".to_string(),
    })?;
    let client = build_http_client().map_err(|details| HostError::Transport {
        server: server.clone(),
        details,
    })?;

    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    Ok(Connection {
        sink: Arc::new(HttpTransport {
            server,
            base_url,
            client,
            frame_tx: Mutex::new(Some(frame_tx)),
        }),
        frames: frame_rx,
    })
}
