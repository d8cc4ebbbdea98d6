//! The host core.
//!
//! A `Host` owns one session per connected server, the shared capability
//! registry, and the single dispatch loop every piece of server-originated
//! traffic funnels through. Servers stay isolated: an operation names its
//! target by arena handle, is dispatched on that server's session only, and
//! nothing a server sends can reach another server except through the
//! read-only registry.

use crate::codec::{methods, RequestId};
use crate::config::{HostConfig, ServerConfig};
use crate::elicitation::{
    ElicitationController, ElicitationOrigin, ElicitationOutcome, ElicitationRequest, UserPrompter,
};
use crate::error::{HostError, RemotePayload, CODE_INTERNAL_ERROR};
use crate::reasoning::{ChosenAction, PlanContext, ReasoningAdapter, SamplingPrompt};
use crate::registry::{Capability, CapabilityKind, CapabilityRegistry, ServerId};
use crate::session::{CallOptions, ServerSession, SessionEvent};
use crate::transport::{self, Connection};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A fire-and-forget notification surfaced to the embedder.
#[derive(Debug)]
pub struct Alert {
    pub server: ServerId,
    pub method: String,
    pub params: Option<Value>,
}

struct HostInner {
    registry: RwLock<CapabilityRegistry>,
    sessions: RwLock<HashMap<ServerId, ServerSession>>,
    reasoning: Arc<dyn ReasoningAdapter>,
    elicitation: ElicitationController,
    alerts: mpsc::UnboundedSender<Alert>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl HostInner {
    fn session(&self, id: ServerId) -> Option<ServerSession> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn server_name(&self, id: ServerId) -> String {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .server_name(id)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }
}

#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Builds a host and its alert stream. The returned receiver carries
    /// generic server notifications; dropping it silently discards them.
    pub fn new(
        reasoning: Arc<dyn ReasoningAdapter>,
        prompter: Arc<dyn UserPrompter>,
    ) -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HostInner {
            registry: RwLock::new(CapabilityRegistry::default()),
            sessions: RwLock::new(HashMap::new()),
            reasoning,
            elicitation: ElicitationController::new(prompter),
            alerts: alert_tx,
            events: event_tx,
        });
        tokio::spawn(run_dispatch(inner.clone(), event_rx));
        (Self { inner }, alert_rx)
    }

    /// Connects one configured server: transport, negotiation, registration.
    pub async fn connect(&self, config: &ServerConfig) -> Result<ServerId, HostError> {
        let connection = transport::connect(config).await?;
        self.attach(&config.id, connection).await
    }

    /// Connects every enabled server concurrently. Per-server results; one
    /// failure never aborts the others.
    pub async fn connect_all(
        &self,
        config: &HostConfig,
    ) -> Vec<(String, Result<ServerId, HostError>)> {
        let connects = config.enabled_servers().map(|server| async move {
            let outcome = self.connect(server).await;
            if let Err(err) = &outcome {
                warn!(server = %server.id, error = %err, "connect failed");
            }
            (server.id.clone(), outcome)
        });
        futures_util::future::join_all(connects).await
    }

    /// Adopts an already-established connection, negotiates, and registers
    /// the declared capabilities. Used directly for in-process servers.
    pub async fn attach(&self, name: &str, connection: Connection) -> Result<ServerId, HostError> {
        let id = self
            .inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register_server(name);
        let session = ServerSession::start(id, name, connection, self.inner.events.clone());
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, session.clone());

        match session.negotiate(NEGOTIATION_TIMEOUT).await {
            Ok(declared) => {
                debug!(server = %name, %id, capabilities = declared.len(), "server attached");
                self.inner
                    .registry
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .replace_capabilities(id, declared);
                Ok(id)
            }
            Err(err) => {
                session.close().await;
                self.inner
                    .sessions
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&id);
                self.inner
                    .registry
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove_server(id);
                Err(err)
            }
        }
    }

    /// Starts draining a server. Registry cleanup happens when the session's
    /// terminal close event arrives.
    pub async fn disconnect(&self, id: ServerId) {
        if let Some(session) = self.inner.session(id) {
            session.close().await;
        }
    }

    pub fn server_name(&self, id: ServerId) -> Option<String> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .server_name(id)
            .map(str::to_string)
    }

    /// Owner-tagged snapshot of everything on offer for one kind.
    pub fn capabilities(&self, kind: CapabilityKind) -> Vec<(ServerId, String, Capability)> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .enumerate(kind)
            .into_iter()
            .map(|(id, name, capability)| (id, name.to_string(), capability.clone()))
            .collect()
    }

    pub fn registry_version(&self) -> u64 {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .version()
    }

    /// Executes one tool on one server. Resolution goes through the registry
    /// first; a name the server never declared fails without wire traffic.
    /// Never retried.
    pub async fn invoke_tool(
        &self,
        server: ServerId,
        name: &str,
        args: Value,
    ) -> Result<Value, HostError> {
        let session = self.resolve(server, CapabilityKind::Tool, name)?;
        session
            .request(
                methods::CALL_TOOL,
                Some(json!({ "name": name, "arguments": args })),
                CallOptions::default(),
            )
            .await
    }

    /// Reads one resource by its access handle. Side-effect-free from the
    /// host's perspective; reading twice is as good as reading once.
    pub async fn read_resource(&self, server: ServerId, uri: &str) -> Result<Value, HostError> {
        let session = {
            let registry = self
                .inner
                .registry
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if registry.lookup_resource(server, uri).is_none() {
                return Err(HostError::MethodNotFound {
                    server: self.inner.server_name(server),
                    name: uri.to_string(),
                });
            }
            drop(registry);
            self.inner
                .session(server)
                .ok_or_else(|| HostError::ConnectionClosed {
                    server: self.inner.server_name(server),
                })?
        };
        session
            .request(
                methods::READ_RESOURCE,
                Some(json!({ "uri": uri })),
                CallOptions::default(),
            )
            .await
    }

    /// Fetches one prompt template. The result is guidance text for the
    /// caller; the host never executes it.
    pub async fn get_prompt(
        &self,
        server: ServerId,
        name: &str,
        args: Value,
    ) -> Result<Value, HostError> {
        let session = self.resolve(server, CapabilityKind::Prompt, name)?;
        session
            .request(
                methods::GET_PROMPT,
                Some(json!({ "name": name, "arguments": args })),
                CallOptions::default(),
            )
            .await
    }

    /// Asks the adapter what to do next, against a snapshot of every tool
    /// currently on offer. The verdict is the adapter's alone.
    pub async fn plan(&self, goal: &str) -> Result<ChosenAction, HostError> {
        let context = PlanContext {
            goal: goal.to_string(),
            tools: self.capabilities(CapabilityKind::Tool),
        };
        self.inner.reasoning.plan(context).await
    }

    /// Carries out a planned action.
    pub async fn execute(&self, action: ChosenAction) -> Result<Value, HostError> {
        match action {
            ChosenAction::InvokeTool { server, name, args } => {
                self.invoke_tool(server, &name, args).await
            }
            ChosenAction::ReadResource { server, uri } => self.read_resource(server, &uri).await,
            ChosenAction::GetPrompt { server, name, args } => {
                self.get_prompt(server, &name, args).await
            }
            ChosenAction::Respond { text } => Ok(json!({ "text": text })),
        }
    }

    /// Host-triggered question for the user. Same controller, same outcome
    /// model as server-triggered elicitation.
    pub async fn ask_user(
        &self,
        message: &str,
        requested_schema: Option<Value>,
    ) -> ElicitationOutcome {
        let mut request = ElicitationRequest::new(ElicitationOrigin::HostPolicy, message);
        request.requested_schema = requested_schema;
        self.inner.elicitation.resolve(request).await
    }

    fn resolve(
        &self,
        server: ServerId,
        kind: CapabilityKind,
        name: &str,
    ) -> Result<ServerSession, HostError> {
        {
            let registry = self
                .inner
                .registry
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if registry.lookup(server, kind, name).is_none() {
                return Err(HostError::MethodNotFound {
                    server: self.inner.server_name(server),
                    name: name.to_string(),
                });
            }
        }
        self.inner
            .session(server)
            .ok_or_else(|| HostError::ConnectionClosed {
                server: self.inner.server_name(server),
            })
    }
}

/// The single synchronization point for server-originated traffic. Requests
/// are handled on spawned tasks so one slow elicitation never stalls the
/// other servers' events.
async fn run_dispatch(inner: Arc<HostInner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Closed { server } => {
                debug!(%server, "session closed, dropping registry entries");
                inner
                    .registry
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove_server(server);
                inner
                    .sessions
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&server);
            }
            SessionEvent::Notification {
                server,
                method,
                params,
            } => {
                if method == methods::NOTIFY_CAPABILITIES_CHANGED {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        refresh_capabilities(inner, server).await;
                    });
                } else {
                    let _ = inner.alerts.send(Alert {
                        server,
                        method,
                        params,
                    });
                }
            }
            SessionEvent::Request {
                server,
                id,
                method,
                params,
            } => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    handle_server_request(inner, server, id, method, params).await;
                });
            }
        }
    }
}

async fn refresh_capabilities(inner: Arc<HostInner>, server: ServerId) {
    let Some(session) = inner.session(server) else {
        return;
    };
    match session.list_capabilities().await {
        Ok(declared) => {
            debug!(server = %session.name(), capabilities = declared.len(), "capability list refreshed");
            inner
                .registry
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .replace_capabilities(server, declared);
        }
        Err(err) => {
            warn!(server = %session.name(), error = %err, "capability re-listing failed");
        }
    }
}

async fn handle_server_request(
    inner: Arc<HostInner>,
    server: ServerId,
    id: RequestId,
    method: String,
    params: Option<Value>,
) {
    let Some(session) = inner.session(server) else {
        return;
    };

    let sent = match method.as_str() {
        methods::SAMPLING => {
            match SamplingPrompt::from_params(session.name(), params.as_ref()) {
                Ok(prompt) => match inner.reasoning.complete(prompt).await {
                    Ok(text) => {
                        session
                            .respond(
                                id,
                                json!({
                                    "role": "assistant",
                                    "content": { "type": "text", "text": text },
                                }),
                            )
                            .await
                    }
                    Err(err) => {
                        session
                            .respond_error(
                                id,
                                RemotePayload {
                                    code: CODE_INTERNAL_ERROR,
                                    message: err.to_string(),
                                    data: None,
                                },
                            )
                            .await
                    }
                },
                Err(err) => {
                    session
                        .respond_error(
                            id,
                            RemotePayload {
                                code: crate::error::CODE_PARSE_ERROR,
                                message: err.to_string(),
                                data: None,
                            },
                        )
                        .await
                }
            }
        }
        methods::ELICITATION => {
            let request =
                ElicitationRequest::from_params(ElicitationOrigin::Server(server), params.as_ref());
            let outcome = inner.elicitation.resolve(request).await;
            session.respond(id, outcome.to_wire()).await
        }
        other => {
            debug!(server = %session.name(), method = %other, "unknown server request method");
            session
                .respond_error(id, RemotePayload::method_not_found(other))
                .await
        }
    };

    if let Err(err) = sent {
        warn!(server = %session.name(), error = %err, "failed to answer server request");
    }
}
