//! Model-client abstraction.
//!
//! A [`ModelClient`] turns a message history into a single model response,
//! streaming partial content through a [`TokenSink`] on the way. The sink is
//! the seam where the [`ThoughtFilter`](crate::thought_filter::ThoughtFilter)
//! sits: the turn executor hands the client a filter-wrapped sink, so the
//! client never knows whether thinking separation is active.
//!
//! Tool binding is declarative — the caller passes the [`ToolSchema`]s the
//! agent may use, and the client surfaces them to the model in whatever wire
//! shape the endpoint expects. Requested invocations come back as structured
//! [`ToolCall`]s, never as token text.

use crate::colloquy::config::ModelEndpoint;
use crate::colloquy::message::{Message, ToolCall};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Receives streamed content chunks during generation.
///
/// Implementations must be cheap and non-blocking; heavy work belongs on the
/// far side of the event bus.
pub trait TokenSink: Send + Sync {
    fn on_token(&self, chunk: &str);
}

/// A sink that discards everything. Useful when streaming is irrelevant.
pub struct NullSink;

impl TokenSink for NullSink {
    fn on_token(&self, _chunk: &str) {}
}

/// Tool description surfaced to the model as a structured schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-Schema-like description of the arguments object.
    pub input_schema: serde_json::Value,
}

/// The model's reply for one invocation.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    /// Full content as produced by the endpoint (pre-filtering).
    pub content: String,
    /// Structured tool invocations requested by the model.
    pub tool_calls: Vec<ToolCall>,
}

/// Result of probing an endpoint via [`ModelClient::verify`].
#[derive(Debug, Clone)]
pub struct EndpointProbe {
    /// Models the endpoint reports as available.
    pub available_models: Vec<String>,
}

/// Failures surfaced by model clients.
#[derive(Debug, Clone)]
pub enum ModelError {
    /// The endpoint did not answer at the transport level.
    EndpointUnreachable(String),
    /// The endpoint answered but does not serve the configured model.
    ModelNotFound(String),
    /// The invocation ran past its deadline.
    InvocationTimeout(String),
    /// The endpoint produced output the client could not interpret.
    MalformedResponse(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::EndpointUnreachable(detail) => {
                write!(f, "model endpoint unreachable: {detail}")
            }
            ModelError::ModelNotFound(detail) => write!(f, "model not found: {detail}"),
            ModelError::InvocationTimeout(detail) => {
                write!(f, "model invocation timed out: {detail}")
            }
            ModelError::MalformedResponse(detail) => {
                write!(f, "malformed model response: {detail}")
            }
        }
    }
}

impl Error for ModelError {}

impl ModelError {
    /// True for failures that invalidate the whole conversation rather than
    /// a single turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ModelError::EndpointUnreachable(_) | ModelError::ModelNotFound(_)
        )
    }
}

/// Interface to a chat model endpoint.
///
/// One client per agent; connection reuse is an implementation detail of the
/// client (see [`clients::ollama::OllamaClient`](crate::clients::ollama::OllamaClient)).
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate a response to `messages`, streaming partial content to
    /// `sink`. `tools` is the set of schemas the model may invoke.
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        sink: &dyn TokenSink,
    ) -> Result<ModelResponse, ModelError>;

    /// Minimal connectivity and model-listing probe.
    async fn verify(&self) -> Result<EndpointProbe, ModelError>;

    /// Name of the model this client talks to.
    fn model_name(&self) -> &str;
}

/// Builds one [`ModelClient`] per agent endpoint.
///
/// The orchestrator is injected with a factory rather than concrete clients
/// so tests can script model behavior per agent.
pub trait ModelClientFactory: Send + Sync {
    fn create(&self, endpoint: &ModelEndpoint) -> Arc<dyn ModelClient>;
}
