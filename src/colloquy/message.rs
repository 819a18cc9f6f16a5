//! Conversation message model.
//!
//! Every utterance, tool exchange, and system prompt in a conversation is a
//! [`Message`]. Messages are immutable once appended to the shared history;
//! thought tokens are never materialized as messages — they only flow to the
//! event bus (see [`thought_filter`](crate::thought_filter)).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Role a message plays in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Context-steering instruction for a model.
    System,
    /// A message from a human user (the opening message is seeded as this).
    Human,
    /// A model-generated message.
    Ai,
    /// The result of a single tool call, paired by `tool_call_id`.
    Tool,
    /// Marker separating completed cycles in exported transcripts.
    CycleMarker,
}

/// A tool invocation requested by a model.
///
/// Each call is matched one-to-one with a subsequent [`Role::Tool`] message
/// whose `tool_call_id` equals this call's `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier correlating the call with its result message.
    pub call_id: String,
    /// Name of the tool as exposed by its server.
    pub tool_name: String,
    /// JSON-shaped arguments. The core never interprets these.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// One entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// Agent id, `"user"`, `"system"`, or `"tool"`.
    pub author: String,
    pub role: Role,
    pub content: String,
    /// Tool invocations requested by this `Ai` message, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `Tool` messages: the `call_id` this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Cycle during which the message was produced, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_index: Option<u32>,
    /// Always false for messages in the shared history.
    #[serde(default)]
    pub is_thought: bool,
    /// Opaque to the core; surfaced to the template renderer and exporters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    fn base(author: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: author.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
            cycle_index: None,
            is_thought: false,
            metadata: HashMap::new(),
        }
    }

    /// A human-role message (e.g. the conversation opener).
    pub fn human(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::base(author, Role::Human, content)
    }

    /// A model-authored message without tool calls.
    pub fn ai(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::base(author, Role::Ai, content)
    }

    /// A model-authored message carrying tool-call requests.
    pub fn ai_with_tool_calls(
        author: impl Into<String>,
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        let mut msg = Self::base(author, Role::Ai, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// A system-role message.
    pub fn system(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::base(author, Role::System, content)
    }

    /// The result of a single tool call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::base("tool", Role::Tool, content);
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    /// Stamp the cycle the message was produced in.
    pub fn at_cycle(mut self, cycle: u32) -> Self {
        self.cycle_index = Some(cycle);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_carries_call_id() {
        let call = ToolCall::new("echo", serde_json::json!({"x": "pong"}));
        let msg = Message::tool_result(call.call_id.clone(), "pong");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some(call.call_id.as_str()));
        assert_eq!(msg.author, "tool");
    }

    #[test]
    fn messages_default_to_non_thought() {
        let msg = Message::ai("alice", "hello");
        assert!(!msg.is_thought);
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn serialized_roles_are_snake_case() {
        let json = serde_json::to_value(Role::CycleMarker).unwrap();
        assert_eq!(json, serde_json::json!("cycle_marker"));
    }
}
