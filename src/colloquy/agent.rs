//! Per-conversation agent runtime.
//!
//! An [`AgentRuntime`] is the live form of an [`AgentConfig`]: identity plus
//! a rendered system prompt and a connected model client. Runtimes are built
//! by the initializer at conversation start and dropped when the
//! orchestrator finishes — nothing about them persists across conversations.

use crate::colloquy::config::{AgentConfig, ModelEndpoint};
use crate::colloquy::model::ModelClient;
use std::collections::HashMap;
use std::sync::Arc;

pub struct AgentRuntime {
    /// Stable identifier used for rotation, scoping, and events.
    pub id: String,
    /// Human-readable name for events and transcripts.
    pub display_name: String,
    /// Raw persona text from configuration.
    pub persona: String,
    /// System prompt materialized from the template for this conversation.
    pub rendered_system_prompt: String,
    pub endpoint: ModelEndpoint,
    /// Whether thought separation publishes thought events for this agent.
    pub thinking_enabled: bool,
    pub client: Arc<dyn ModelClient>,
    /// Opaque metadata carried through from configuration.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentRuntime {
    pub fn new(
        config: &AgentConfig,
        rendered_system_prompt: String,
        client: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            id: config.id.clone(),
            display_name: config.name.clone(),
            persona: config.persona.clone(),
            rendered_system_prompt,
            endpoint: config.model.clone(),
            thinking_enabled: config.model.thinking,
            client,
            metadata: config.metadata.clone(),
        }
    }
}
