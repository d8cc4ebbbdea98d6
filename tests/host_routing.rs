//! End-to-end routing scenarios over in-process pipe transports: scripted
//! servers on one end, a `Host` on the other.

use async_trait::async_trait;
use concierge::codec::{self, methods, Envelope, RequestId};
use concierge::elicitation::{ElicitationOutcome, ElicitationRequest, UserPrompter};
use concierge::error::HostError;
use concierge::reasoning::{ChosenAction, PlanContext, ReasoningAdapter, SamplingPrompt};
use concierge::registry::CapabilityKind;
use concierge::router::Host;
use concierge::transport::{pipe, Connection, Transport};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct FixedCompletion(&'static str);

#[async_trait]
impl ReasoningAdapter for FixedCompletion {
    async fn plan(&self, _context: PlanContext) -> Result<ChosenAction, HostError> {
        Ok(ChosenAction::Respond {
            text: self.0.to_string(),
        })
    }

    async fn complete(&self, _prompt: SamplingPrompt) -> Result<String, HostError> {
        Ok(self.0.to_string())
    }
}

struct QueuedPrompter {
    outcomes: Mutex<VecDeque<ElicitationOutcome>>,
    asked: AtomicUsize,
}

impl QueuedPrompter {
    fn new(outcomes: Vec<ElicitationOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            asked: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl UserPrompter for QueuedPrompter {
    async fn prompt(&self, _request: ElicitationRequest) -> ElicitationOutcome {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or(ElicitationOutcome::Dismiss)
    }
}

fn host_with(
    adapter: Arc<dyn ReasoningAdapter>,
    prompter: Arc<dyn UserPrompter>,
) -> (Host, mpsc::UnboundedReceiver<concierge::router::Alert>) {
    Host::new(adapter, prompter)
}

fn default_host() -> Host {
    let prompter = QueuedPrompter::new(Vec::new());
    let (host, _alerts) = host_with(Arc::new(FixedCompletion("ok")), prompter);
    host
}

/// Answers negotiation, records every later request, and replies with `tag`.
fn spawn_server(
    mut end: Connection,
    name: &'static str,
    declarations: Value,
    tag: Value,
) -> mpsc::UnboundedReceiver<Value> {
    let (calls_tx, calls_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(frame) = end.frames.recv().await {
            match codec::decode(name, &frame) {
                Ok(Envelope::Request { id, method, .. }) if method == methods::INITIALIZE => {
                    let reply =
                        Envelope::response(id, json!({ "capabilities": declarations.clone() }));
                    let _ = end.sink.send(codec::encode(&reply)).await;
                }
                Ok(Envelope::Request { id, method, params }) => {
                    let _ = calls_tx.send(json!({ "method": method, "params": params }));
                    let _ = end
                        .sink
                        .send(codec::encode(&Envelope::response(id, tag.clone())))
                        .await;
                }
                _ => {}
            }
        }
    });
    calls_rx
}

/// Answers negotiation and then swallows everything. Returns the server-side
/// sink so tests can sever the connection.
fn spawn_silent_server(
    mut end: Connection,
    name: &'static str,
    declarations: Value,
) -> Arc<dyn Transport> {
    let sink = end.sink.clone();
    tokio::spawn(async move {
        while let Some(frame) = end.frames.recv().await {
            if let Ok(Envelope::Request { id, method, .. }) = codec::decode(name, &frame) {
                if method == methods::INITIALIZE {
                    let reply =
                        Envelope::response(id, json!({ "capabilities": declarations.clone() }));
                    let _ = end.sink.send(codec::encode(&reply)).await;
                }
            }
        }
    });
    sink
}

/// Drives negotiation for a server end the test keeps manual control of.
async fn serve_negotiation(end: &mut Connection, name: &str, declarations: Value) {
    let frame = end.frames.recv().await.expect("initialize frame");
    let id = match codec::decode(name, &frame).expect("decode initialize") {
        Envelope::Request { id, method, .. } => {
            assert_eq!(method, methods::INITIALIZE);
            id
        }
        other => panic!("expected initialize request, got {other:?}"),
    };
    end.sink
        .send(codec::encode(&Envelope::response(
            id,
            json!({ "capabilities": declarations }),
        )))
        .await
        .expect("send declarations");
    let frame = end.frames.recv().await.expect("initialized frame");
    assert!(frame.contains(methods::NOTIFY_INITIALIZED));
}

fn tool_declarations(names: &[&str]) -> Value {
    Value::Array(
        names
            .iter()
            .map(|name| json!({ "kind": "tool", "name": name }))
            .collect(),
    )
}

#[tokio::test]
async fn identically_named_tools_route_only_to_their_owner() {
    let host = default_host();

    let (alpha_host, alpha_server) = pipe::pair("alpha");
    let (beta_host, beta_server) = pipe::pair("beta");
    spawn_server(
        alpha_server,
        "alpha",
        tool_declarations(&["salsa.make"]),
        json!({ "by": "alpha" }),
    );
    let mut beta_calls = spawn_server(
        beta_server,
        "beta",
        tool_declarations(&["salsa.make"]),
        json!({ "by": "beta" }),
    );

    let alpha = host.attach("alpha", alpha_host).await.expect("attach alpha");
    let beta = host.attach("beta", beta_host).await.expect("attach beta");
    assert_ne!(alpha, beta);

    let result = host
        .invoke_tool(alpha, "salsa.make", json!({ "heat": "medium" }))
        .await
        .expect("invoke on alpha");
    assert_eq!(result, json!({ "by": "alpha" }));
    assert!(beta_calls.try_recv().is_err());
}

#[tokio::test]
async fn undeclared_capability_fails_without_reaching_the_server() {
    let host = default_host();
    let (alpha_host, alpha_server) = pipe::pair("alpha");
    let mut calls = spawn_server(
        alpha_server,
        "alpha",
        tool_declarations(&["salsa.make"]),
        json!({}),
    );
    let alpha = host.attach("alpha", alpha_host).await.expect("attach");

    let err = host
        .invoke_tool(alpha, "pico.make", json!({}))
        .await
        .expect_err("undeclared tool");
    assert!(matches!(err, HostError::MethodNotFound { server, name }
        if server == "alpha" && name == "pico.make"));
    assert!(calls.try_recv().is_err());
}

#[tokio::test]
async fn severed_connection_fails_all_pending_and_spares_other_sessions() {
    let host = default_host();

    let (alpha_host, alpha_server) = pipe::pair("alpha");
    let (beta_host, beta_server) = pipe::pair("beta");
    let alpha_sink = spawn_silent_server(alpha_server, "alpha", tool_declarations(&["slow.op"]));
    spawn_server(
        beta_server,
        "beta",
        tool_declarations(&["salsa.make"]),
        json!({ "by": "beta" }),
    );

    let alpha = host.attach("alpha", alpha_host).await.expect("attach alpha");
    let beta = host.attach("beta", beta_host).await.expect("attach beta");

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let host = host.clone();
            tokio::spawn(async move { host.invoke_tool(alpha, "slow.op", json!({})).await })
        })
        .collect();
    // Let the three requests hit the wire before severing it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    alpha_sink.close().await;
    for handle in pending {
        let err = handle.await.expect("join").expect_err("severed");
        assert!(matches!(err, HostError::ConnectionClosed { server } if server == "alpha"));
    }

    // Alpha's catalog entries are gone; beta is untouched.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let owners: Vec<_> = host
        .capabilities(CapabilityKind::Tool)
        .into_iter()
        .map(|(_, owner, _)| owner)
        .collect();
    assert_eq!(owners, vec!["beta".to_string()]);
    let result = host
        .invoke_tool(beta, "salsa.make", json!({}))
        .await
        .expect("beta still serves");
    assert_eq!(result, json!({ "by": "beta" }));
}

#[tokio::test]
async fn elicitation_requests_resolve_each_outcome_exactly_once() {
    let prompter = QueuedPrompter::new(vec![
        ElicitationOutcome::Accept {
            content: json!({ "spice": "hot" }),
        },
        ElicitationOutcome::Decline,
        ElicitationOutcome::Dismiss,
    ]);
    let (host, _alerts) = host_with(Arc::new(FixedCompletion("ok")), prompter.clone());

    let (gamma_host, mut gamma) = pipe::pair("gamma");
    let (attached, _) = tokio::join!(
        host.attach("gamma", gamma_host),
        serve_negotiation(&mut gamma, "gamma", tool_declarations(&[])),
    );
    attached.expect("attach");

    for (request_id, action) in [("e1", "accept"), ("e2", "decline"), ("e3", "cancel")] {
        gamma
            .sink
            .send(codec::encode(&Envelope::request(
                RequestId::String(request_id.to_string()),
                methods::ELICITATION,
                Some(json!({ "message": "how spicy?" })),
            )))
            .await
            .expect("send elicitation");
        let frame = gamma.frames.recv().await.expect("outcome frame");
        match codec::decode("gamma", &frame).expect("decode outcome") {
            Envelope::Response { id, result } => {
                assert_eq!(id, RequestId::String(request_id.to_string()));
                assert_eq!(result["action"], json!(action));
                if action == "accept" {
                    assert_eq!(result["content"]["spice"], json!("hot"));
                }
            }
            other => panic!("expected response, got {other:?}"),
        }
    }
    assert_eq!(prompter.asked.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn sampling_answers_return_only_to_the_asking_server() {
    let prompter = QueuedPrompter::new(Vec::new());
    let (host, _alerts) = host_with(Arc::new(FixedCompletion("pair it with rice")), prompter);

    // Alpha holds three unanswered calls while beta asks for a completion.
    let (alpha_host, alpha_server) = pipe::pair("alpha");
    let alpha_sink = spawn_silent_server(alpha_server, "alpha", tool_declarations(&["slow.op"]));
    let alpha = host.attach("alpha", alpha_host).await.expect("attach alpha");

    let (beta_host, mut beta) = pipe::pair("beta");
    let (attached, _) = tokio::join!(
        host.attach("beta", beta_host),
        serve_negotiation(&mut beta, "beta", tool_declarations(&[])),
    );
    attached.expect("attach beta");

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let host = host.clone();
            tokio::spawn(async move { host.invoke_tool(alpha, "slow.op", json!({})).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    beta.sink
        .send(codec::encode(&Envelope::request(
            RequestId::String("s1".to_string()),
            methods::SAMPLING,
            Some(json!({
                "messages": [
                    {"role": "user", "content": {"type": "text", "text": "what pairs with mole?"}},
                ],
            })),
        )))
        .await
        .expect("send sampling request");

    let frame = beta.frames.recv().await.expect("sampling answer");
    match codec::decode("beta", &frame).expect("decode answer") {
        Envelope::Response { id, result } => {
            assert_eq!(id, RequestId::String("s1".to_string()));
            assert_eq!(result["content"]["text"], json!("pair it with rice"));
        }
        other => panic!("expected response, got {other:?}"),
    }
    // Exactly one answer; nothing else lands on beta's wire.
    let extra = tokio::time::timeout(Duration::from_millis(50), beta.frames.recv()).await;
    assert!(extra.is_err());

    // Alpha's calls are still outstanding, untouched by beta's exchange.
    for handle in &pending {
        assert!(!handle.is_finished());
    }
    alpha_sink.close().await;
    for handle in pending {
        assert!(handle.await.expect("join").is_err());
    }
}

#[tokio::test]
async fn resource_reads_are_repeatable() {
    let host = default_host();
    let (alpha_host, alpha_server) = pipe::pair("alpha");
    let mut calls = spawn_server(
        alpha_server,
        "alpha",
        json!([{ "kind": "resource", "name": "menu", "uri": "menu://today" }]),
        json!({ "contents": "tamales, mole, horchata" }),
    );
    let alpha = host.attach("alpha", alpha_host).await.expect("attach");

    let first = host
        .read_resource(alpha, "menu://today")
        .await
        .expect("first read");
    let second = host
        .read_resource(alpha, "menu://today")
        .await
        .expect("second read");
    assert_eq!(first, second);

    for _ in 0..2 {
        let observed = calls.try_recv().expect("observed read");
        assert_eq!(observed["method"], json!(methods::READ_RESOURCE));
        assert_eq!(observed["params"]["uri"], json!("menu://today"));
    }

    let err = host
        .read_resource(alpha, "menu://yesterday")
        .await
        .expect_err("unknown handle");
    assert!(matches!(err, HostError::MethodNotFound { .. }));
}

#[tokio::test]
async fn capability_change_notification_refreshes_the_catalog() {
    let host = default_host();
    let (gamma_host, mut gamma) = pipe::pair("gamma");
    let (attached, _) = tokio::join!(
        host.attach("gamma", gamma_host),
        serve_negotiation(&mut gamma, "gamma", tool_declarations(&["chop"])),
    );
    attached.expect("attach");
    let version_before = host.registry_version();
    assert_eq!(host.capabilities(CapabilityKind::Tool).len(), 1);

    gamma
        .sink
        .send(codec::encode(&Envelope::notification(
            methods::NOTIFY_CAPABILITIES_CHANGED,
            None,
        )))
        .await
        .expect("send change notification");

    // The host re-lists; answer with the grown catalog.
    let frame = gamma.frames.recv().await.expect("re-list request");
    let id = match codec::decode("gamma", &frame).expect("decode re-list") {
        Envelope::Request { id, method, .. } => {
            assert_eq!(method, methods::LIST_CAPABILITIES);
            id
        }
        other => panic!("expected re-list request, got {other:?}"),
    };
    gamma
        .sink
        .send(codec::encode(&Envelope::response(
            id,
            json!({ "capabilities": tool_declarations(&["chop", "dice"]) }),
        )))
        .await
        .expect("send grown catalog");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let names: Vec<_> = host
        .capabilities(CapabilityKind::Tool)
        .into_iter()
        .map(|(_, _, capability)| capability.name)
        .collect();
    assert_eq!(names, vec!["chop".to_string(), "dice".to_string()]);
    assert!(host.registry_version() > version_before);
}

#[tokio::test]
async fn generic_notifications_surface_on_the_alert_stream() {
    let prompter = QueuedPrompter::new(Vec::new());
    let (host, mut alerts) = host_with(Arc::new(FixedCompletion("ok")), prompter);

    let (gamma_host, mut gamma) = pipe::pair("gamma");
    let (attached, _) = tokio::join!(
        host.attach("gamma", gamma_host),
        serve_negotiation(&mut gamma, "gamma", tool_declarations(&[])),
    );
    let gamma_id = attached.expect("attach");

    gamma
        .sink
        .send(codec::encode(&Envelope::notification(
            "pantry/restocked",
            Some(json!({ "items": 12 })),
        )))
        .await
        .expect("send notification");

    let alert = alerts.recv().await.expect("alert");
    assert_eq!(alert.server, gamma_id);
    assert_eq!(alert.method, "pantry/restocked");
    assert_eq!(alert.params, Some(json!({ "items": 12 })));
}

#[tokio::test]
async fn unknown_server_request_methods_get_a_method_not_found_reply() {
    let host = default_host();
    let (gamma_host, mut gamma) = pipe::pair("gamma");
    let (attached, _) = tokio::join!(
        host.attach("gamma", gamma_host),
        serve_negotiation(&mut gamma, "gamma", tool_declarations(&[])),
    );
    attached.expect("attach");

    gamma
        .sink
        .send(codec::encode(&Envelope::request(
            RequestId::Number(41),
            "pantry/raid",
            None,
        )))
        .await
        .expect("send unknown request");

    let frame = gamma.frames.recv().await.expect("reply");
    match codec::decode("gamma", &frame).expect("decode reply") {
        Envelope::Error { id, error } => {
            assert_eq!(id, RequestId::Number(41));
            assert_eq!(error.code, concierge::error::CODE_METHOD_NOT_FOUND);
        }
        other => panic!("expected error reply, got {other:?}"),
    }
}
