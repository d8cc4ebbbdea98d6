//! User-preference questions.
//!
//! Servers may ask the user for input mid-operation, and host policy may do
//! the same. Both funnel through one controller so the outcome model stays
//! uniform: every question resolves to exactly one of three outcomes, and a
//! dismissed question is never re-asked.

use crate::registry::ServerId;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElicitationOrigin {
    Server(ServerId),
    HostPolicy,
}

/// One question for the user. Consumed by value when resolved, so a single
/// request can never produce two outcomes.
#[derive(Debug)]
pub struct ElicitationRequest {
    pub message: String,
    /// Shape the asker wants the answer in, when it cares.
    pub requested_schema: Option<Value>,
    pub origin: ElicitationOrigin,
}

impl ElicitationRequest {
    pub fn new(origin: ElicitationOrigin, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            requested_schema: None,
            origin,
        }
    }

    /// Builds a request from wire params. Missing fields degrade to an empty
    /// question rather than failing; the user can still dismiss it.
    pub fn from_params(origin: ElicitationOrigin, params: Option<&Value>) -> Self {
        let message = params
            .and_then(|params| params.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let requested_schema = params
            .and_then(|params| params.get("requestedSchema"))
            .cloned();
        Self {
            message,
            requested_schema,
            origin,
        }
    }
}

/// Terminal outcome of one question.
///
/// `Decline` is an explicit "no"; `Dismiss` means the user put the question
/// aside without answering. The asker is expected to treat them differently,
/// which is why they never collapse into one case.
#[derive(Debug, Clone, PartialEq)]
pub enum ElicitationOutcome {
    Accept { content: Value },
    Decline,
    Dismiss,
}

impl ElicitationOutcome {
    /// Wire form sent back to the asking server.
    pub fn to_wire(&self) -> Value {
        match self {
            ElicitationOutcome::Accept { content } => json!({
                "action": "accept",
                "content": content,
            }),
            ElicitationOutcome::Decline => json!({ "action": "decline" }),
            ElicitationOutcome::Dismiss => json!({ "action": "cancel" }),
        }
    }
}

/// Whatever surfaces the question to an actual user. Test doubles script
/// answers; a real embedder renders UI.
#[async_trait]
pub trait UserPrompter: Send + Sync {
    async fn prompt(&self, request: ElicitationRequest) -> ElicitationOutcome;
}

/// Declines everything. The safe default for headless runs.
pub struct AutoDecline;

#[async_trait]
impl UserPrompter for AutoDecline {
    async fn prompt(&self, _request: ElicitationRequest) -> ElicitationOutcome {
        ElicitationOutcome::Decline
    }
}

pub struct ElicitationController {
    prompter: Arc<dyn UserPrompter>,
}

impl ElicitationController {
    pub fn new(prompter: Arc<dyn UserPrompter>) -> Self {
        Self { prompter }
    }

    /// Resolves one question to its single terminal outcome.
    pub async fn resolve(&self, request: ElicitationRequest) -> ElicitationOutcome {
        let origin = request.origin;
        let outcome = self.prompter.prompt(request).await;
        debug!(?origin, ?outcome, "elicitation resolved");
        outcome
    }
}
