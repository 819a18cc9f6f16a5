//! System-prompt rendering.
//!
//! Full template engines are a host concern; the core only needs a seam. A
//! [`PromptRenderer`] turns a template plus a [`PromptContext`] into the
//! system prompt stored on each agent. The built-in
//! [`DefaultPromptRenderer`] substitutes `{{ path }}` placeholders for the
//! documented context keys, leaves anything it does not recognize untouched,
//! and never fails. When no template is configured, agents get
//! `{{ agent.persona }}` — their persona verbatim.

use std::collections::HashMap;

/// Template used when the configuration does not provide one.
pub const DEFAULT_SYSTEM_PROMPT_TEMPLATE: &str = "{{ agent.persona }}";

/// Values available to system-prompt templates.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub agent_name: String,
    pub agent_persona: String,
    pub agent_metadata: HashMap<String, serde_json::Value>,
    pub scenario_name: Option<String>,
    pub goal: Option<String>,
    pub brevity: Option<String>,
    pub max_cycles: u32,
    pub participating_agents: Vec<String>,
    /// Names of the tools available to this agent.
    pub tools: Vec<String>,
}

impl PromptContext {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "agent.name" => Some(self.agent_name.clone()),
            "agent.persona" => Some(self.agent_persona.clone()),
            "conversation.scenario_name" => Some(self.scenario_name.clone().unwrap_or_default()),
            "conversation.goal" => Some(self.goal.clone().unwrap_or_default()),
            "conversation.brevity" => Some(self.brevity.clone().unwrap_or_default()),
            "conversation.max_cycles" => Some(self.max_cycles.to_string()),
            "conversation.participating_agents" => Some(self.participating_agents.join(", ")),
            "tools" => Some(self.tools.join(", ")),
            _ => key.strip_prefix("agent.metadata.").and_then(|meta_key| {
                self.agent_metadata.get(meta_key).map(|value| match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            }),
        }
    }
}

/// Renders system-prompt templates. Implementations must not fail: fall back
/// to something sensible instead of erroring a conversation start.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, template: &str, context: &PromptContext) -> String;
}

/// `{{ path }}` substitution over the documented context keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPromptRenderer;

impl PromptRenderer for DefaultPromptRenderer {
    fn render(&self, template: &str, context: &PromptContext) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            match after_open.find("}}") {
                Some(close) => {
                    let key = after_open[..close].trim();
                    match context.lookup(key) {
                        Some(value) => out.push_str(&value),
                        // Unknown placeholders pass through verbatim.
                        None => {
                            out.push_str(&rest[open..open + 2 + close + 2]);
                        }
                    }
                    rest = &after_open[close + 2..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PromptContext {
        PromptContext {
            agent_name: "Alice".into(),
            agent_persona: "A pragmatic engineer.".into(),
            agent_metadata: HashMap::from([(
                "team".to_string(),
                serde_json::Value::String("core".into()),
            )]),
            scenario_name: Some("standup".into()),
            goal: Some("align on priorities".into()),
            brevity: None,
            max_cycles: 4,
            participating_agents: vec!["alice".into(), "bob".into()],
            tools: vec!["echo".into()],
        }
    }

    #[test]
    fn default_template_is_the_persona() {
        let rendered = DefaultPromptRenderer.render(DEFAULT_SYSTEM_PROMPT_TEMPLATE, &context());
        assert_eq!(rendered, "A pragmatic engineer.");
    }

    #[test]
    fn substitutes_known_keys() {
        let rendered = DefaultPromptRenderer.render(
            "You are {{ agent.name }} ({{ agent.metadata.team }}). Goal: {{ conversation.goal }}. \
             Peers: {{ conversation.participating_agents }}. Tools: {{ tools }}.",
            &context(),
        );
        assert_eq!(
            rendered,
            "You are Alice (core). Goal: align on priorities. Peers: alice, bob. Tools: echo."
        );
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let rendered = DefaultPromptRenderer.render("{{ mystery.value }} stays", &context());
        assert_eq!(rendered, "{{ mystery.value }} stays");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        let rendered = DefaultPromptRenderer.render("broken {{ agent.name", &context());
        assert_eq!(rendered, "broken {{ agent.name");
    }
}
