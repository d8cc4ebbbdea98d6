//! Typed failure taxonomy for host-side routing.
//!
//! Transport and codec level faults are translated into these variants at the
//! session boundary; callers of the router never see raw I/O errors. Every
//! variant names the server it came from so failures stay attributable.

use serde_json::Value;
use thiserror::Error;

/// Wire-level error payload reported by a server.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RemotePayload {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemotePayload {
    /// Reply payload for a request whose method nobody recognizes.
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: CODE_METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }
}

/// JSON-RPC code servers use for unknown methods.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC code for malformed payloads.
pub const CODE_PARSE_ERROR: i64 = -32700;
/// JSON-RPC code for failures while handling a well-formed request.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    /// Call attempted before negotiation completed.
    #[error("server '{server}' is not ready ({state})")]
    NotReady { server: String, state: &'static str },

    /// The capability or method is unknown, either to the registry or to the
    /// server itself.
    #[error("server '{server}' does not provide '{name}'")]
    MethodNotFound { server: String, name: String },

    /// Malformed wire data on a connection.
    #[error("parse error on server '{server}': {details}")]
    ParseError { server: String, details: String },

    /// The transport died before or during the call.
    #[error("connection to server '{server}' closed")]
    ConnectionClosed { server: String },

    /// The per-request deadline expired. The session stays usable.
    #[error("request '{method}' to server '{server}' timed out")]
    Timeout { server: String, method: String },

    /// The server explicitly reported a failure.
    #[error("server '{server}' reported error {}: {}", .payload.code, .payload.message)]
    RemoteError {
        server: String,
        payload: RemotePayload,
    },

    /// The caller withdrew the request.
    #[error("request to server '{server}' was cancelled")]
    Cancelled { server: String },

    /// I/O-level transport fault (spawn failure, write error, HTTP fault).
    #[error("transport fault on server '{server}': {details}")]
    Transport { server: String, details: String },
}

impl HostError {
    /// The server a failure is attributed to.
    pub fn server(&self) -> &str {
        match self {
            HostError::NotReady { server, .. }
            | HostError::MethodNotFound { server, .. }
            | HostError::ParseError { server, .. }
            | HostError::ConnectionClosed { server }
            | HostError::Timeout { server, .. }
            | HostError::RemoteError { server, .. }
            | HostError::Cancelled { server }
            | HostError::Transport { server, .. } => server,
        }
    }

    /// Maps a server-reported payload onto the taxonomy: the well-known
    /// method-not-found code gets its own variant, everything else stays a
    /// remote error with the payload preserved.
    pub fn from_remote(server: &str, method: &str, payload: RemotePayload) -> Self {
        if payload.code == CODE_METHOD_NOT_FOUND {
            HostError::MethodNotFound {
                server: server.to_string(),
                name: method.to_string(),
            }
        } else {
            HostError::RemoteError {
                server: server.to_string(),
                payload,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_found_code_maps_to_its_own_variant() {
        let payload = RemotePayload {
            code: CODE_METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
            data: None,
        };
        let err = HostError::from_remote("alpha", "tools/call", payload);
        assert_eq!(
            err,
            HostError::MethodNotFound {
                server: "alpha".to_string(),
                name: "tools/call".to_string(),
            }
        );
    }

    #[test]
    fn other_codes_stay_remote_errors_with_payload() {
        let payload = RemotePayload {
            code: -32000,
            message: "grill is on fire".to_string(),
            data: Some(serde_json::json!({"station": "grill"})),
        };
        let err = HostError::from_remote("alpha", "tools/call", payload.clone());
        match err {
            HostError::RemoteError { server, payload: p } => {
                assert_eq!(server, "alpha");
                assert_eq!(p, payload);
            }
            other => panic!("expected RemoteError, got {other:?}"),
        }
    }

    #[test]
    fn method_not_found_reply_payload_uses_the_wire_code() {
        let payload = RemotePayload::method_not_found("grill/flambe");
        assert_eq!(payload.code, CODE_METHOD_NOT_FOUND);
        assert!(payload.message.contains("grill/flambe"));
        assert!(payload.data.is_none());
    }

    #[test]
    fn every_variant_names_its_server() {
        let err = HostError::Timeout {
            server: "beta".to_string(),
            method: "tools/call".to_string(),
        };
        assert_eq!(err.server(), "beta");
        assert!(err.to_string().contains("beta"));
    }
}
