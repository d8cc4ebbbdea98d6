//! Wire envelope encoding and decoding.
//!
//! Three envelope kinds travel over every transport: requests (id + method),
//! responses (id + result or error), and notifications (method, no id, no
//! response expected). The wire shape is JSON-RPC 2.0; one JSON text per
//! frame. The id type (number or string) is preserved exactly, never coerced,
//! so responses correlate against the id the request was sent with.

use crate::error::{HostError, RemotePayload};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Method names understood by the host. Servers may expose any method they
/// like; these are the ones the routing layer itself speaks.
pub mod methods {
    /// Host -> server, once, during negotiation. Result carries the server's
    /// capability declarations.
    pub const INITIALIZE: &str = "initialize";
    /// Host -> server re-listing after a change notification.
    pub const LIST_CAPABILITIES: &str = "capabilities/list";
    pub const CALL_TOOL: &str = "tools/call";
    pub const READ_RESOURCE: &str = "resources/read";
    pub const GET_PROMPT: &str = "prompts/get";
    /// Server -> host completion request. Answered by the reasoning adapter.
    pub const SAMPLING: &str = "sampling/createMessage";
    /// Server -> host user-preference request.
    pub const ELICITATION: &str = "elicitation/create";
    pub const NOTIFY_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFY_CAPABILITIES_CHANGED: &str = "notifications/capabilities/changed";
    pub const NOTIFY_PROGRESS: &str = "notifications/progress";
    pub const NOTIFY_CANCELLED: &str = "notifications/cancelled";
}

const JSONRPC_VERSION: &str = "2.0";

/// Request correlation id. Number or string, preserved as sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestId::Number(n) => serializer.serialize_i64(*n),
            RequestId::String(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(RequestId::Number)
                .ok_or_else(|| serde::de::Error::custom("request id must be an integer")),
            Value::String(s) => Ok(RequestId::String(s)),
            _ => Err(serde::de::Error::custom(
                "request id must be an integer or a string",
            )),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    Error {
        id: RequestId,
        error: RemotePayload,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Envelope::Response { id, result }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification {
            method: method.into(),
            params,
        }
    }
}

/// Wire form before classification. All fields optional so malformed input
/// is reported instead of crashing.
#[derive(Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RemotePayload>,
}

/// Serializes an envelope to one wire frame.
pub fn encode(envelope: &Envelope) -> String {
    let raw = match envelope {
        Envelope::Request { id, method, params } => RawMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.clone()),
            method: Some(method.clone()),
            params: params.clone(),
            result: None,
            error: None,
        },
        Envelope::Response { id, result } => RawMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.clone()),
            method: None,
            params: None,
            result: Some(result.clone()),
            error: None,
        },
        Envelope::Error { id, error } => RawMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.clone()),
            method: None,
            params: None,
            result: None,
            error: Some(error.clone()),
        },
        Envelope::Notification { method, params } => RawMessage {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.clone()),
            params: params.clone(),
            result: None,
            error: None,
        },
    };
    serde_json::to_string(&raw).unwrap_or_else(|_| String::from("{}"))
}

/// Decodes one frame into an envelope, attributing parse failures to the
/// owning server. The codec only classifies; whether a parse failure tears
/// the connection down is session policy.
pub fn decode(server: &str, frame: &str) -> Result<Envelope, HostError> {
    let parse_error = |details: String| HostError::ParseError {
        server: server.to_string(),
        details,
    };

    let raw: RawMessage =
        serde_json::from_str(frame).map_err(|err| parse_error(err.to_string()))?;

    if raw.jsonrpc != JSONRPC_VERSION {
        return Err(parse_error(format!(
            "unsupported protocol version '{}'",
            raw.jsonrpc
        )));
    }

    match (raw.id, raw.method, raw.error) {
        (Some(id), None, Some(error)) => Ok(Envelope::Error { id, error }),
        (Some(id), Some(method), None) => Ok(Envelope::Request {
            id,
            method,
            params: raw.params,
        }),
        (None, Some(method), None) => Ok(Envelope::Notification {
            method,
            params: raw.params,
        }),
        (Some(id), None, None) => Ok(Envelope::Response {
            id,
            result: raw.result.unwrap_or(Value::Null),
        }),
        _ => Err(parse_error(
            "frame is neither a request, response, nor notification".to_string(),
        )),
    }
}
