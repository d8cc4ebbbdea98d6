//! The judgment seam.
//!
//! Everything that requires actual reasoning, whether picking the next action
//! for a goal or completing a sampling request from a server, goes through
//! one adapter trait. The routing layer never makes those decisions itself;
//! tests plug in scripted adapters, embedders plug in a model.

use crate::error::HostError;
use crate::registry::{Capability, ServerId};
use async_trait::async_trait;
use serde_json::Value;

/// One conversational turn in a sampling request. Text only; sampling
/// payloads carry no structured content and no tool access.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingMessage {
    pub role: String,
    pub text: String,
}

/// A server's completion request, decoded from `sampling/createMessage`
/// params.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPrompt {
    pub system: Option<String>,
    pub messages: Vec<SamplingMessage>,
    pub max_tokens: Option<u64>,
}

impl SamplingPrompt {
    /// Decodes wire params, rejecting anything that is not plain text.
    pub fn from_params(server: &str, params: Option<&Value>) -> Result<Self, HostError> {
        let parse_error = |details: String| HostError::ParseError {
            server: server.to_string(),
            details,
        };

        let params =
            params.ok_or_else(|| parse_error("sampling request has no params".to_string()))?;
        let raw_messages = params
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error("sampling request has no messages".to_string()))?;

        let mut messages = Vec::with_capacity(raw_messages.len());
        for raw in raw_messages {
            let role = raw
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_string();
            let content = raw
                .get("content")
                .ok_or_else(|| parse_error("sampling message has no content".to_string()))?;
            let text = match content.get("type").and_then(Value::as_str) {
                Some("text") => content
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| parse_error("text content without text field".to_string()))?,
                Some(other) => {
                    return Err(parse_error(format!(
                        "unsupported sampling content type '{other}'"
                    )))
                }
                None => {
                    return Err(parse_error("sampling content has no type".to_string()));
                }
            };
            messages.push(SamplingMessage {
                role,
                text: text.to_string(),
            });
        }

        Ok(Self {
            system: params
                .get("systemPrompt")
                .and_then(Value::as_str)
                .map(str::to_string),
            messages,
            max_tokens: params.get("maxTokens").and_then(Value::as_u64),
        })
    }
}

/// What the adapter gets to plan against: the goal and an owner-tagged
/// snapshot of every tool currently on offer.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub goal: String,
    pub tools: Vec<(ServerId, String, Capability)>,
}

/// The adapter's verdict on what to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ChosenAction {
    InvokeTool {
        server: ServerId,
        name: String,
        args: Value,
    },
    ReadResource {
        server: ServerId,
        uri: String,
    },
    GetPrompt {
        server: ServerId,
        name: String,
        args: Value,
    },
    /// Nothing to execute; answer the goal directly.
    Respond { text: String },
}

/// Sole source of judgment for the host. `plan` picks actions against a
/// capability snapshot; `complete` answers server sampling requests.
#[async_trait]
pub trait ReasoningAdapter: Send + Sync {
    async fn plan(&self, context: PlanContext) -> Result<ChosenAction, HostError>;
    async fn complete(&self, prompt: SamplingPrompt) -> Result<String, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_only_sampling_params_decode() {
        let params = json!({
            "systemPrompt": "you are a sous-chef",
            "maxTokens": 256,
            "messages": [
                {"role": "user", "content": {"type": "text", "text": "what pairs with mole?"}},
            ],
        });
        let prompt = SamplingPrompt::from_params("alpha", Some(&params)).expect("decode");
        assert_eq!(prompt.system.as_deref(), Some("you are a sous-chef"));
        assert_eq!(prompt.max_tokens, Some(256));
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].text, "what pairs with mole?");
    }

    #[test]
    fn non_text_content_is_rejected() {
        let params = json!({
            "messages": [
                {"role": "user", "content": {"type": "image", "data": "…"}},
            ],
        });
        let err = SamplingPrompt::from_params("alpha", Some(&params)).expect_err("image content");
        assert!(matches!(err, HostError::ParseError { server, .. } if server == "alpha"));
    }

    #[test]
    fn missing_params_are_a_parse_error() {
        assert!(matches!(
            SamplingPrompt::from_params("alpha", None),
            Err(HostError::ParseError { .. })
        ));
    }
}
