//! Client for Ollama-compatible chat endpoints.
//!
//! Talks the Ollama HTTP API: streaming NDJSON responses from `POST
//! /api/chat` (tokens are forwarded to the caller's [`TokenSink`] as they
//! arrive, tool invocations come back as structured `tool_calls`) and `GET
//! /api/tags` for the connectivity/model probe behind
//! `test_model_endpoint`. One `reqwest` client per agent endpoint; the
//! connection pool is reused across turns.

use crate::colloquy::config::ModelEndpoint;
use crate::colloquy::message::{Message, Role, ToolCall};
use crate::colloquy::model::{
    EndpointProbe, ModelClient, ModelClientFactory, ModelError, ModelResponse, TokenSink,
    ToolSchema,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model_name: String,
    options: serde_json::Map<String, serde_json::Value>,
}

impl OllamaClient {
    pub fn new(endpoint: &ModelEndpoint) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            model_name: endpoint.model_name.clone(),
            options: endpoint.parameters.clone(),
        }
    }

    fn chat_payload(&self, messages: &[Message], tools: &[ToolSchema]) -> serde_json::Value {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(wire_message)
            .collect();

        let mut payload = serde_json::json!({
            "model": self.model_name,
            "messages": wire_messages,
            "stream": true,
        });
        if !self.options.is_empty() {
            payload["options"] = serde_json::Value::Object(self.options.clone());
        }
        if !tools.is_empty() {
            payload["tools"] = serde_json::Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.input_schema,
                            }
                        })
                    })
                    .collect(),
            );
        }
        payload
    }
}

/// Map a history message onto the Ollama chat wire shape. Cycle markers are
/// bookkeeping and never sent to models.
fn wire_message(message: &Message) -> Option<serde_json::Value> {
    let role = match message.role {
        Role::System => "system",
        Role::Human => "user",
        Role::Ai => "assistant",
        Role::Tool => "tool",
        Role::CycleMarker => return None,
    };
    let mut wire = serde_json::json!({ "role": role, "content": message.content });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = serde_json::Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    serde_json::json!({
                        "function": {
                            "name": call.tool_name,
                            "arguments": call.arguments,
                        }
                    })
                })
                .collect(),
        );
    }
    Some(wire)
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

fn classify_api_error(detail: String) -> ModelError {
    if detail.to_lowercase().contains("not found") {
        ModelError::ModelNotFound(detail)
    } else {
        ModelError::MalformedResponse(detail)
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        sink: &dyn TokenSink,
    ) -> Result<ModelResponse, ModelError> {
        let payload = self.chat_payload(messages, tools);
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::InvocationTimeout(e.to_string())
                } else {
                    ModelError::EndpointUnreachable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            log::error!("ollama chat request failed ({status}): {body}");
            return Err(classify_api_error(format!("{status}: {body}")));
        }

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        let consume_line = |line: &str,
                            content: &mut String,
                            tool_calls: &mut Vec<ToolCall>|
         -> Result<(), ModelError> {
            let chunk: ChatChunk = serde_json::from_str(line)
                .map_err(|e| ModelError::MalformedResponse(format!("{e}: {line}")))?;
            if let Some(error) = chunk.error {
                return Err(classify_api_error(error));
            }
            if let Some(message) = chunk.message {
                if !message.content.is_empty() {
                    sink.on_token(&message.content);
                    content.push_str(&message.content);
                }
                for call in message.tool_calls {
                    tool_calls.push(ToolCall::new(call.function.name, call.function.arguments));
                }
            }
            Ok(())
        };

        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(|e| {
                if e.is_timeout() {
                    ModelError::InvocationTimeout(e.to_string())
                } else {
                    ModelError::EndpointUnreachable(e.to_string())
                }
            })?;
            buf.extend_from_slice(&bytes);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                consume_line(line, &mut content, &mut tool_calls)?;
            }
        }
        let trailing = String::from_utf8_lossy(&buf);
        let trailing = trailing.trim();
        if !trailing.is_empty() {
            consume_line(trailing, &mut content, &mut tool_calls)?;
        }

        Ok(ModelResponse {
            content,
            tool_calls,
        })
    }

    async fn verify(&self) -> Result<EndpointProbe, ModelError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ModelError::EndpointUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ModelError::EndpointUnreachable(format!(
                "endpoint answered {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        let available_models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();

        // Model tags often carry suffixes (e.g. "llama3:latest"), so accept
        // prefix matches in both directions.
        let available = available_models
            .iter()
            .any(|m| m.contains(&self.model_name) || m.starts_with(&self.model_name));
        if !available {
            return Err(ModelError::ModelNotFound(format!(
                "'{}' not served; available: {}",
                self.model_name,
                available_models.join(", ")
            )));
        }

        Ok(EndpointProbe { available_models })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Default factory: one [`OllamaClient`] per endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct OllamaClientFactory;

impl ModelClientFactory for OllamaClientFactory {
    fn create(&self, endpoint: &ModelEndpoint) -> Arc<dyn ModelClient> {
        Arc::new(OllamaClient::new(endpoint))
    }
}
