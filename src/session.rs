//! One server, one session.
//!
//! A `ServerSession` owns exactly one transport connection and everything
//! that happens on it: the negotiation handshake, correlation of concurrent
//! outstanding requests by id, per-request deadlines and cancellation, and
//! the fan-out of unsolicited server-originated traffic to the host loop.
//! Sessions never touch each other's state; all cross-session interaction
//! goes through the host.

use crate::codec::{self, methods, Envelope, RequestId};
use crate::error::{HostError, RemotePayload};
use crate::registry::{Capability, ServerId};
use crate::transport::{Connection, Frame, Transport};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Session lifecycle. Calls are only accepted in `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Negotiating,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// Unsolicited traffic a session hands to the host loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// Server-initiated request; the host must answer via
    /// [`ServerSession::respond`] or [`ServerSession::respond_error`].
    Request {
        server: ServerId,
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// One-way message; no response expected or possible.
    Notification {
        server: ServerId,
        method: String,
        params: Option<Value>,
    },
    /// The transport died; every pending request has already been failed.
    Closed { server: ServerId },
}

/// Informational progress tied to one outstanding request. Never alters the
/// completion semantics of the call it belongs to.
#[derive(Debug, Clone)]
pub struct ProgressUpdate(pub Value);

/// Per-call knobs.
pub struct CallOptions {
    pub timeout: Duration,
    /// Receives progress notifications the server ties to this request's id.
    pub progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            progress: None,
        }
    }
}

struct PendingEntry {
    reply: oneshot::Sender<Result<Value, HostError>>,
    method: String,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    created_at: Instant,
}

struct SessionShared {
    id: ServerId,
    name: String,
    sink: Arc<dyn Transport>,
    state: std::sync::Mutex<SessionState>,
    pending: std::sync::Mutex<HashMap<RequestId, PendingEntry>>,
    next_request_id: AtomicI64,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn closed_error(&self) -> HostError {
        HostError::ConnectionClosed {
            server: self.name.clone(),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail_all_pending(&self) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            let _ = entry.reply.send(Err(self.closed_error()));
        }
        if count > 0 {
            debug!(server = %self.name, failed = count, "failed pending requests on close");
        }
    }
}

fn request_id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => json!(n),
        RequestId::String(s) => json!(s),
    }
}

fn request_id_from_value(value: &Value) -> Option<RequestId> {
    match value {
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        Value::String(s) => Some(RequestId::String(s.clone())),
        _ => None,
    }
}

fn cancellation_notice(id: &RequestId) -> Frame {
    codec::encode(&Envelope::notification(
        methods::NOTIFY_CANCELLED,
        Some(json!({ "requestId": request_id_value(id) })),
    ))
}

/// An issued request whose response has not arrived yet. Awaiting it races
/// the correlated response against the deadline; cancelling frees the
/// correlation slot immediately. Dropping the call without awaiting it
/// withdraws the request the same way `cancel` does, so an abandoned future
/// never leaves a slot behind.
pub struct PendingCall {
    shared: Arc<SessionShared>,
    id: RequestId,
    method: String,
    reply: oneshot::Receiver<Result<Value, HostError>>,
    timeout: Duration,
    issued_at: Instant,
    completed: bool,
}

impl PendingCall {
    pub fn request_id(&self) -> &RequestId {
        &self.id
    }

    /// Waits for the correlated response. The deadline counts from when the
    /// request was issued, not from this call. On expiry the slot is freed,
    /// so a late same-id response is discarded by id-miss instead of being
    /// misdelivered; the session itself stays usable.
    pub async fn wait(mut self) -> Result<Value, HostError> {
        let remaining = self.timeout.saturating_sub(self.issued_at.elapsed());
        let outcome = tokio::select! {
            outcome = &mut self.reply => match outcome {
                Ok(result) => result,
                Err(_) => Err(self.shared.closed_error()),
            },
            _ = tokio::time::sleep(remaining) => {
                self.shared.pending().remove(&self.id);
                debug!(server = %self.shared.name, request_id = %self.id, method = %self.method, "request deadline expired");
                Err(HostError::Timeout {
                    server: self.shared.name.clone(),
                    method: self.method.clone(),
                })
            }
        };
        self.completed = true;
        outcome
    }

    /// Withdraws the request: frees the slot host-side and sends a
    /// best-effort cancellation notice to the server. Whatever the server
    /// eventually answers is discarded by id-miss.
    pub async fn cancel(mut self) -> HostError {
        self.shared.pending().remove(&self.id);
        let _ = self.shared.sink.send(cancellation_notice(&self.id)).await;
        debug!(server = %self.shared.name, request_id = %self.id, "request cancelled by caller");
        self.completed = true;
        HostError::Cancelled {
            server: self.shared.name.clone(),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.shared.pending().remove(&self.id).is_none() {
            return;
        }
        debug!(server = %self.shared.name, request_id = %self.id, "in-flight call dropped, withdrawing request");
        let frame = cancellation_notice(&self.id);
        let shared = self.shared.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = shared.sink.send(frame).await;
            });
        }
    }
}

#[derive(Clone)]
pub struct ServerSession {
    shared: Arc<SessionShared>,
}

impl ServerSession {
    /// Takes ownership of a connected transport and spawns the reader that
    /// drives this session. The session starts in `Connecting`; call
    /// [`negotiate`] before issuing requests.
    ///
    /// [`negotiate`]: ServerSession::negotiate
    pub fn start(
        id: ServerId,
        name: &str,
        connection: Connection,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            id,
            name: name.to_string(),
            sink: connection.sink,
            state: std::sync::Mutex::new(SessionState::Connecting),
            pending: std::sync::Mutex::new(HashMap::new()),
            next_request_id: AtomicI64::new(0),
        });
        tokio::spawn(run_reader(shared.clone(), connection.frames, events));
        Self { shared }
    }

    pub fn id(&self) -> ServerId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Exchanges capability declarations, exactly once. Valid only from
    /// `Connecting`; afterwards the session is `Active` and accepts calls.
    pub async fn negotiate(&self, timeout: Duration) -> Result<Vec<Capability>, HostError> {
        let state = self.shared.state();
        if state != SessionState::Connecting {
            return Err(HostError::NotReady {
                server: self.shared.name.clone(),
                state: state.label(),
            });
        }
        self.shared.set_state(SessionState::Negotiating);

        let params = json!({
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let call = self
            .begin_unchecked(methods::INITIALIZE, Some(params), CallOptions {
                timeout,
                progress: None,
            })
            .await?;
        let result = call.wait().await?;
        let declared = parse_declarations(&self.shared.name, &result)?;

        self.send_notification(methods::NOTIFY_INITIALIZED, None)
            .await?;
        self.shared.set_state(SessionState::Active);
        debug!(server = %self.shared.name, capabilities = declared.len(), "session active");
        Ok(declared)
    }

    /// Re-fetches the declaration list after a change notification.
    pub async fn list_capabilities(&self) -> Result<Vec<Capability>, HostError> {
        let result = self
            .request(methods::LIST_CAPABILITIES, None, CallOptions::default())
            .await?;
        parse_declarations(&self.shared.name, &result)
    }

    /// Issues a request and waits for its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<Value, HostError> {
        self.begin(method, params, options).await?.wait().await
    }

    /// Issues a request without waiting, for callers that want to cancel or
    /// observe progress. Fails `NotReady` outside `Active`.
    pub async fn begin(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<PendingCall, HostError> {
        let state = self.shared.state();
        if state != SessionState::Active {
            return Err(HostError::NotReady {
                server: self.shared.name.clone(),
                state: state.label(),
            });
        }
        self.begin_unchecked(method, params, options).await
    }

    async fn begin_unchecked(
        &self,
        method: &str,
        params: Option<Value>,
        options: CallOptions,
    ) -> Result<PendingCall, HostError> {
        let id = RequestId::Number(self.shared.next_request_id.fetch_add(1, Ordering::SeqCst));
        let issued_at = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending().insert(
            id.clone(),
            PendingEntry {
                reply: reply_tx,
                method: method.to_string(),
                progress: options.progress,
                created_at: issued_at,
            },
        );

        let frame = codec::encode(&Envelope::request(id.clone(), method, params));
        debug!(server = %self.shared.name, request_id = %id, method = %method, "sending request");
        if let Err(err) = self.shared.sink.send(frame).await {
            self.shared.pending().remove(&id);
            return Err(err);
        }

        Ok(PendingCall {
            shared: self.shared.clone(),
            id,
            method: method.to_string(),
            reply: reply_rx,
            timeout: options.timeout,
            issued_at,
            completed: false,
        })
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), HostError> {
        let frame = codec::encode(&Envelope::notification(method, params));
        self.shared.sink.send(frame).await
    }

    /// Answers a server-initiated request.
    pub async fn respond(&self, id: RequestId, result: Value) -> Result<(), HostError> {
        debug!(server = %self.shared.name, request_id = %id, "sending response to server request");
        let frame = codec::encode(&Envelope::Response { id, result });
        self.shared.sink.send(frame).await
    }

    /// Rejects a server-initiated request.
    pub async fn respond_error(&self, id: RequestId, error: RemotePayload) -> Result<(), HostError> {
        debug!(server = %self.shared.name, request_id = %id, code = error.code, "sending error to server request");
        let frame = codec::encode(&Envelope::Error { id, error });
        self.shared.sink.send(frame).await
    }

    /// Stops accepting calls and tears the transport down. Pending requests
    /// resolve `ConnectionClosed` via the reader's terminal path.
    pub async fn close(&self) {
        let state = self.shared.state();
        if matches!(state, SessionState::Draining | SessionState::Closed) {
            return;
        }
        self.shared.set_state(SessionState::Draining);
        self.shared.sink.close().await;
    }
}

fn parse_declarations(server: &str, result: &Value) -> Result<Vec<Capability>, HostError> {
    let declarations = result
        .get("capabilities")
        .ok_or_else(|| HostError::ParseError {
            server: server.to_string(),
            details: "capability declaration missing 'capabilities' list".to_string(),
        })?;
    serde_json::from_value(declarations.clone()).map_err(|err| HostError::ParseError {
        server: server.to_string(),
        details: format!("invalid capability declaration: {err}"),
    })
}

async fn run_reader(
    shared: Arc<SessionShared>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(frame) = frames.recv().await {
        let envelope = match codec::decode(&shared.name, &frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Malformed frames are logged and skipped; tearing the
                // connection down is the embedder's call, not the codec's.
                warn!(server = %shared.name, error = %err, "discarding malformed frame");
                continue;
            }
        };
        dispatch_envelope(&shared, envelope, &events).await;
    }

    shared.fail_all_pending();
    shared.set_state(SessionState::Closed);
    debug!(server = %shared.name, "session closed");
    let _ = events.send(SessionEvent::Closed { server: shared.id });
}

async fn dispatch_envelope(
    shared: &Arc<SessionShared>,
    envelope: Envelope,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    match envelope {
        Envelope::Response { id, result } => {
            let entry = shared.pending().remove(&id);
            match entry {
                Some(entry) => {
                    debug!(
                        server = %shared.name,
                        request_id = %id,
                        elapsed = ?entry.created_at.elapsed(),
                        "response correlated"
                    );
                    let _ = entry.reply.send(Ok(result));
                }
                None => {
                    debug!(server = %shared.name, request_id = %id, "late response discarded");
                }
            }
        }
        Envelope::Error { id, error } => {
            let entry = shared.pending().remove(&id);
            match entry {
                Some(entry) => {
                    let err = HostError::from_remote(&shared.name, &entry.method, error);
                    let _ = entry.reply.send(Err(err));
                }
                None => {
                    debug!(server = %shared.name, request_id = %id, "late error discarded");
                }
            }
        }
        Envelope::Notification { method, params } if method == methods::NOTIFY_PROGRESS => {
            let target = params
                .as_ref()
                .and_then(|params| params.get("requestId"))
                .and_then(request_id_from_value);
            if let Some(id) = target {
                let pending = shared.pending();
                if let Some(entry) = pending.get(&id) {
                    if let Some(progress) = &entry.progress {
                        let update = params.clone().unwrap_or(Value::Null);
                        let _ = progress.send(ProgressUpdate(update));
                    }
                    return;
                }
            }
            // Progress for an unknown or finished request falls through as a
            // plain notification.
            let _ = events.send(SessionEvent::Notification {
                server: shared.id,
                method,
                params,
            });
        }
        Envelope::Notification { method, params } => {
            let _ = events.send(SessionEvent::Notification {
                server: shared.id,
                method,
                params,
            });
        }
        Envelope::Request { id, method, params } => {
            debug!(server = %shared.name, request_id = %id, method = %method, "server-initiated request");
            let _ = events.send(SessionEvent::Request {
                server: shared.id,
                id,
                method,
                params,
            });
        }
    }
}
