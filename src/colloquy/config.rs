//! Validated configuration consumed by the orchestrator.
//!
//! The core does not parse files: hosts deserialize whatever format they
//! like (YAML, JSON, TOML) into these structures — environment-variable
//! substitution included — and hand the result to
//! [`Orchestrator::new`](crate::orchestrator::Orchestrator::new).
//!
//! Two scenario shapes are accepted: a legacy single-scenario `conversation`
//! block, and a `conversations` list. When both are present the list takes
//! precedence. [`RootConfig::validate`] enforces the structural rules; a
//! failing config rejects `start`.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::time::Duration;

fn default_version() -> String {
    "1.0".to_string()
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_max_cycles() -> u32 {
    10
}

fn default_turn_timeout_secs() -> u64 {
    300
}

/// Where and how to reach an agent's model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEndpoint {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the endpoint (e.g. `http://localhost:11434`).
    pub url: String,
    pub model_name: String,
    /// Sampling parameters passed through untouched (temperature, top_p, ...).
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Enables thought separation for this agent.
    #[serde(default)]
    pub thinking: bool,
}

/// Declaration of a tool server to launch.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One configured agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier; also the rotation key.
    pub id: String,
    /// Display name for events and transcripts.
    pub name: String,
    /// Persona text embedded into the system prompt.
    pub persona: String,
    pub model: ModelEndpoint,
    /// Servers started for this agent only, registered as `{id}_{name}`.
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
    /// Opaque; surfaced to the template renderer.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A named bundle of participants, pacing, and termination rules.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub brevity: Option<String>,
    pub starting_agent: String,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Subset of configured agents taking part; all of them when omitted.
    #[serde(default)]
    pub agents_involved: Option<Vec<String>>,
    /// Scenario-specific opener; falls back to the global first message.
    #[serde(default)]
    pub first_message: Option<String>,
    #[serde(default)]
    pub keyword_triggers: Vec<String>,
    /// Quiet full cycles before the conversation ends, if set.
    #[serde(default)]
    pub silence_threshold: Option<u32>,
    /// Trimmed length at or below which an utterance counts as quiet.
    #[serde(default)]
    pub silence_char_cutoff: Option<usize>,
}

impl ScenarioConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

/// One-shot setup settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializationConfig {
    /// Template for per-agent system prompts; `{{ agent.persona }}` when
    /// omitted.
    #[serde(default)]
    pub system_prompt_template: Option<String>,
    pub first_message: String,
}

/// Tool servers shared by every agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolServersConfig {
    #[serde(default)]
    pub global: Vec<ToolServerConfig>,
}

/// Root of the validated configuration tree.
#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub agents: Vec<AgentConfig>,
    /// Legacy single-scenario shape.
    #[serde(default)]
    pub conversation: Option<ScenarioConfig>,
    /// Multi-scenario shape; takes precedence over `conversation`.
    #[serde(default)]
    pub conversations: Vec<ScenarioConfig>,
    pub initialization: InitializationConfig,
    #[serde(default)]
    pub tool_servers: ToolServersConfig,
}

/// Summary row returned by `list_scenarios`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScenarioDescriptor {
    pub name: Option<String>,
    pub goal: Option<String>,
    pub starting_agent: String,
    pub max_cycles: u32,
    pub participating_agents: Vec<String>,
    pub is_default: bool,
}

impl RootConfig {
    /// All scenarios in declaration order. A legacy `conversation` block is
    /// treated as one anonymous scenario.
    pub fn scenarios(&self) -> Vec<&ScenarioConfig> {
        if !self.conversations.is_empty() {
            self.conversations.iter().collect()
        } else {
            self.conversation.iter().collect()
        }
    }

    /// Resolve a scenario by name, or the first defined when `name` is None.
    pub fn scenario(&self, name: Option<&str>) -> Option<&ScenarioConfig> {
        let scenarios = self.scenarios();
        match name {
            Some(wanted) => scenarios
                .into_iter()
                .find(|s| s.name.as_deref() == Some(wanted)),
            None => scenarios.into_iter().next(),
        }
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Agents taking part in `scenario`, in declared order: the scenario's
    /// `agents_involved` order when given, otherwise the configured agent
    /// order.
    pub fn participants(&self, scenario: &ScenarioConfig) -> Vec<String> {
        match &scenario.agents_involved {
            Some(involved) => involved
                .iter()
                .filter(|id| self.agent(id).is_some())
                .cloned()
                .collect(),
            None => self.agents.iter().map(|a| a.id.clone()).collect(),
        }
    }

    /// Descriptors for every scenario; the first is the default.
    pub fn scenario_descriptors(&self) -> Vec<ScenarioDescriptor> {
        self.scenarios()
            .into_iter()
            .enumerate()
            .map(|(i, s)| ScenarioDescriptor {
                name: s.name.clone(),
                goal: s.goal.clone(),
                starting_agent: s.starting_agent.clone(),
                max_cycles: s.max_cycles,
                participating_agents: self.participants(s),
                is_default: i == 0,
            })
            .collect()
    }

    /// Structural validation; a failing config rejects `start`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.len() < 2 {
            return Err(ConfigError::TooFewAgents(self.agents.len()));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.clone()) {
                return Err(ConfigError::DuplicateAgentId(agent.id.clone()));
            }
            if agent.name.trim().is_empty() {
                return Err(ConfigError::MissingField(agent.id.clone(), "name"));
            }
            if agent.persona.trim().is_empty() {
                return Err(ConfigError::MissingField(agent.id.clone(), "persona"));
            }
            if agent.model.url.trim().is_empty() {
                return Err(ConfigError::MissingField(agent.id.clone(), "model.url"));
            }
            if agent.model.model_name.trim().is_empty() {
                return Err(ConfigError::MissingField(agent.id.clone(), "model.model_name"));
            }
        }

        let scenarios = self.scenarios();
        if scenarios.is_empty() {
            return Err(ConfigError::NoScenario);
        }

        for scenario in scenarios {
            let label = scenario.name.clone().unwrap_or_else(|| "default".to_string());
            if let Some(involved) = &scenario.agents_involved {
                if involved.len() < 2 {
                    return Err(ConfigError::TooFewParticipants(label));
                }
                for id in involved {
                    if self.agent(id).is_none() {
                        return Err(ConfigError::UnknownParticipant(label, id.clone()));
                    }
                }
                if !involved.iter().any(|id| *id == scenario.starting_agent) {
                    return Err(ConfigError::StartingAgentNotParticipating(
                        label,
                        scenario.starting_agent.clone(),
                    ));
                }
            } else if self.agent(&scenario.starting_agent).is_none() {
                return Err(ConfigError::UnknownStartingAgent(
                    label,
                    scenario.starting_agent.clone(),
                ));
            }
            if scenario.max_cycles == 0 {
                return Err(ConfigError::ZeroMaxCycles(label));
            }
            let opener = scenario
                .first_message
                .as_deref()
                .unwrap_or(&self.initialization.first_message);
            if opener.trim().is_empty() {
                return Err(ConfigError::EmptyFirstMessage(label));
            }
        }

        Ok(())
    }
}

/// Structural problems that make a configuration unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    TooFewAgents(usize),
    DuplicateAgentId(String),
    MissingField(String, &'static str),
    NoScenario,
    TooFewParticipants(String),
    UnknownParticipant(String, String),
    UnknownStartingAgent(String, String),
    StartingAgentNotParticipating(String, String),
    ZeroMaxCycles(String),
    EmptyFirstMessage(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::TooFewAgents(n) => {
                write!(f, "at least two agents are required, found {n}")
            }
            ConfigError::DuplicateAgentId(id) => write!(f, "duplicate agent id '{id}'"),
            ConfigError::MissingField(agent, field) => {
                write!(f, "agent '{agent}' is missing required field '{field}'")
            }
            ConfigError::NoScenario => write!(f, "no scenario is defined"),
            ConfigError::TooFewParticipants(scenario) => {
                write!(f, "scenario '{scenario}' needs at least two participants")
            }
            ConfigError::UnknownParticipant(scenario, agent) => {
                write!(f, "scenario '{scenario}' names unknown agent '{agent}'")
            }
            ConfigError::UnknownStartingAgent(scenario, agent) => write!(
                f,
                "scenario '{scenario}' starting agent '{agent}' is not configured"
            ),
            ConfigError::StartingAgentNotParticipating(scenario, agent) => write!(
                f,
                "scenario '{scenario}' starting agent '{agent}' is not a participant"
            ),
            ConfigError::ZeroMaxCycles(scenario) => {
                write!(f, "scenario '{scenario}' must allow at least one cycle")
            }
            ConfigError::EmptyFirstMessage(scenario) => {
                write!(f, "scenario '{scenario}' has no opening message")
            }
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> RootConfig {
        serde_json::from_value(serde_json::json!({
            "agents": [
                {
                    "id": "alice",
                    "name": "Alice",
                    "persona": "A pragmatic engineer.",
                    "model": {"url": "http://localhost:11434", "model_name": "llama3"}
                },
                {
                    "id": "bob",
                    "name": "Bob",
                    "persona": "A skeptical reviewer.",
                    "model": {"url": "http://localhost:11434", "model_name": "mistral", "thinking": true}
                }
            ],
            "conversation": {"starting_agent": "alice", "max_cycles": 3},
            "initialization": {"first_message": "Please begin."}
        }))
        .unwrap()
    }

    #[test]
    fn legacy_single_scenario_shape_validates() {
        let config = sample_config();
        config.validate().unwrap();
        assert_eq!(config.scenarios().len(), 1);
        assert_eq!(config.scenario(None).unwrap().starting_agent, "alice");
    }

    #[test]
    fn conversations_list_takes_precedence() {
        let mut config = sample_config();
        config.conversations = vec![ScenarioConfig {
            name: Some("debate".into()),
            goal: None,
            brevity: None,
            starting_agent: "bob".into(),
            max_cycles: 5,
            turn_timeout_secs: 60,
            agents_involved: None,
            first_message: None,
            keyword_triggers: vec![],
            silence_threshold: None,
            silence_char_cutoff: None,
        }];
        assert_eq!(config.scenarios().len(), 1);
        assert_eq!(
            config.scenario(Some("debate")).unwrap().starting_agent,
            "bob"
        );
        assert_eq!(config.scenario(None).unwrap().starting_agent, "bob");
    }

    #[test]
    fn rejects_single_agent() {
        let mut config = sample_config();
        config.agents.truncate(1);
        assert_eq!(config.validate(), Err(ConfigError::TooFewAgents(1)));
    }

    #[test]
    fn rejects_unknown_starting_agent() {
        let mut config = sample_config();
        config.conversation.as_mut().unwrap().starting_agent = "mallory".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownStartingAgent(_, _))
        ));
    }

    #[test]
    fn rejects_starting_agent_outside_participants() {
        let mut config = sample_config();
        config.conversation.as_mut().unwrap().agents_involved =
            Some(vec!["alice".into(), "bob".into()]);
        config.conversation.as_mut().unwrap().starting_agent = "bob".into();
        config.validate().unwrap();

        config.conversation.as_mut().unwrap().agents_involved = Some(vec!["bob".into()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooFewParticipants(_))
        ));
    }

    #[test]
    fn participants_keep_declared_order() {
        let mut config = sample_config();
        config.conversation.as_mut().unwrap().agents_involved =
            Some(vec!["bob".into(), "alice".into()]);
        let scenario = config.scenario(None).unwrap().clone();
        assert_eq!(config.participants(&scenario), vec!["bob", "alice"]);
    }

    #[test]
    fn rejects_empty_opener() {
        let mut config = sample_config();
        config.initialization.first_message = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyFirstMessage(_))
        ));
    }
}
