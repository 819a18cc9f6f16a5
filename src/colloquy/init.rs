//! One-shot conversation setup.
//!
//! The initializer resolves the requested scenario, applies runtime
//! overrides, freezes a [`ScenarioSnapshot`], renders each participant's
//! system prompt, and seeds the opening message. Agent-scoped tool servers
//! are declared here as [`ServerSpec`]s; the orchestrator starts them before
//! prompts are rendered so templates can list the tools each agent actually
//! has.

use crate::colloquy::agent::AgentRuntime;
use crate::colloquy::config::{ConfigError, RootConfig, ScenarioConfig};
use crate::colloquy::message::Message;
use crate::colloquy::model::ModelClientFactory;
use crate::colloquy::prompt::{
    PromptContext, PromptRenderer, DEFAULT_SYSTEM_PROMPT_TEMPLATE,
};
use crate::colloquy::state::{
    ConversationState, ScenarioSnapshot, DEFAULT_MAX_TOOL_ITERATIONS, DEFAULT_SILENCE_CHAR_CUTOFF,
    DEFAULT_TOOL_CALL_TIMEOUT,
};
use crate::colloquy::tool_registry::ServerSpec;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Runtime overrides applied on top of the selected scenario.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_cycles: Option<u32>,
    pub starting_agent: Option<String>,
}

/// Problems that prevent a conversation from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    UnknownScenario(String),
    InvalidOverride(String),
    Config(ConfigError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::UnknownScenario(name) => write!(f, "unknown scenario '{name}'"),
            InitError::InvalidOverride(detail) => write!(f, "invalid override: {detail}"),
            InitError::Config(err) => write!(f, "invalid configuration: {err}"),
        }
    }
}

impl Error for InitError {}

impl From<ConfigError> for InitError {
    fn from(err: ConfigError) -> Self {
        InitError::Config(err)
    }
}

pub struct Initializer {
    config: Arc<RootConfig>,
    renderer: Arc<dyn PromptRenderer>,
}

impl Initializer {
    pub fn new(config: Arc<RootConfig>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { config, renderer }
    }

    /// Resolve the scenario, validate overrides, and freeze a snapshot.
    pub fn resolve(
        &self,
        scenario_name: Option<&str>,
        overrides: &Overrides,
    ) -> Result<ScenarioSnapshot, InitError> {
        self.config.validate()?;

        let scenario: &ScenarioConfig = match scenario_name {
            Some(name) => self
                .config
                .scenario(Some(name))
                .ok_or_else(|| InitError::UnknownScenario(name.to_string()))?,
            None => self
                .config
                .scenario(None)
                .ok_or(InitError::Config(ConfigError::NoScenario))?,
        };

        let participating_agents = self.config.participants(scenario);

        let starting_agent = match &overrides.starting_agent {
            Some(agent) => {
                if !participating_agents.iter().any(|id| id == agent) {
                    return Err(InitError::InvalidOverride(format!(
                        "starting agent '{agent}' is not a participant"
                    )));
                }
                agent.clone()
            }
            None => scenario.starting_agent.clone(),
        };

        let max_cycles = match overrides.max_cycles {
            Some(0) => {
                return Err(InitError::InvalidOverride(
                    "max_cycles must be at least 1".into(),
                ))
            }
            Some(n) => n,
            None => scenario.max_cycles,
        };

        Ok(ScenarioSnapshot {
            name: scenario.name.clone(),
            goal: scenario.goal.clone(),
            brevity: scenario.brevity.clone(),
            max_cycles,
            starting_agent,
            participating_agents,
            turn_timeout: scenario.turn_timeout(),
            keyword_triggers: scenario.keyword_triggers.clone(),
            silence_threshold: scenario.silence_threshold,
            silence_char_cutoff: scenario
                .silence_char_cutoff
                .unwrap_or(DEFAULT_SILENCE_CHAR_CUTOFF),
            tool_call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        })
    }

    /// Specs for the agent-scoped tool servers of every participant.
    pub fn agent_server_specs(&self, snapshot: &ScenarioSnapshot) -> Vec<ServerSpec> {
        let mut specs = Vec::new();
        for agent_id in &snapshot.participating_agents {
            let Some(agent) = self.config.agent(agent_id) else {
                continue;
            };
            for server in &agent.tool_servers {
                specs.push(
                    ServerSpec::new(&server.name, &server.command)
                        .with_args(server.args.clone())
                        .with_env(server.env.clone())
                        .scoped_to(agent_id.clone()),
                );
            }
        }
        specs
    }

    /// Build a runtime for every participant, rendering its system prompt.
    ///
    /// `tools_by_agent` supplies the tool names visible to each agent so
    /// templates can enumerate them.
    pub fn build_agents(
        &self,
        snapshot: &ScenarioSnapshot,
        tools_by_agent: &HashMap<String, Vec<String>>,
        factory: &dyn ModelClientFactory,
    ) -> Vec<AgentRuntime> {
        let template = self
            .config
            .initialization
            .system_prompt_template
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT_TEMPLATE.to_string());

        let mut agents = Vec::with_capacity(snapshot.participating_agents.len());
        for agent_id in &snapshot.participating_agents {
            let Some(config) = self.config.agent(agent_id) else {
                continue;
            };
            let context = PromptContext {
                agent_name: config.name.clone(),
                agent_persona: config.persona.clone(),
                agent_metadata: config.metadata.clone(),
                scenario_name: snapshot.name.clone(),
                goal: snapshot.goal.clone(),
                brevity: snapshot.brevity.clone(),
                max_cycles: snapshot.max_cycles,
                participating_agents: snapshot.participating_agents.clone(),
                tools: tools_by_agent.get(agent_id).cloned().unwrap_or_default(),
            };
            let rendered = self.renderer.render(&template, &context);
            log::debug!(
                "rendered system prompt for '{}' ({} chars)",
                agent_id,
                rendered.len()
            );
            let client = factory.create(&config.model);
            agents.push(AgentRuntime::new(config, rendered, client));
        }
        agents
    }

    /// Create the initial state with the opening message seeded.
    pub fn seed_state(&self, snapshot: ScenarioSnapshot) -> ConversationState {
        let opener = self
            .config
            .scenario(snapshot.name.as_deref())
            .and_then(|s| s.first_message.clone())
            .unwrap_or_else(|| self.config.initialization.first_message.clone());

        let starting_agent = snapshot.starting_agent.clone();
        let mut state = ConversationState::new(snapshot);
        state.append(
            Message::human(starting_agent, opener)
                .with_metadata("purpose", serde_json::json!("conversation_starter")),
        );
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colloquy::config::ModelEndpoint;
    use crate::colloquy::message::Role;
    use crate::colloquy::model::{
        EndpointProbe, ModelClient, ModelError, ModelResponse, TokenSink, ToolSchema,
    };
    use crate::colloquy::prompt::DefaultPromptRenderer;
    use async_trait::async_trait;

    struct StubClient;

    #[async_trait]
    impl ModelClient for StubClient {
        async fn generate(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _sink: &dyn TokenSink,
        ) -> Result<ModelResponse, ModelError> {
            Ok(ModelResponse::default())
        }

        async fn verify(&self) -> Result<EndpointProbe, ModelError> {
            Ok(EndpointProbe {
                available_models: vec![],
            })
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    struct StubFactory;

    impl ModelClientFactory for StubFactory {
        fn create(&self, _endpoint: &ModelEndpoint) -> Arc<dyn ModelClient> {
            Arc::new(StubClient)
        }
    }

    fn config() -> Arc<RootConfig> {
        Arc::new(
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
                        "model": {"url": "http://localhost:11434", "model_name": "mistral"}
                    }
                ],
                "conversations": [
                    {"name": "standup", "starting_agent": "alice", "max_cycles": 3},
                    {
                        "name": "retro",
                        "starting_agent": "bob",
                        "max_cycles": 5,
                        "first_message": "What went wrong?"
                    }
                ],
                "initialization": {
                    "system_prompt_template": "You are {{ agent.name }}. Tools: {{ tools }}.",
                    "first_message": "Please begin."
                }
            }))
            .unwrap(),
        )
    }

    fn initializer() -> Initializer {
        Initializer::new(config(), Arc::new(DefaultPromptRenderer))
    }

    #[test]
    fn first_scenario_is_the_default() {
        let snapshot = initializer()
            .resolve(None, &Overrides::default())
            .unwrap();
        assert_eq!(snapshot.name.as_deref(), Some("standup"));
        assert_eq!(snapshot.starting_agent, "alice");
        assert_eq!(snapshot.max_cycles, 3);
    }

    #[test]
    fn named_scenario_and_overrides() {
        let overrides = Overrides {
            max_cycles: Some(8),
            starting_agent: Some("alice".into()),
        };
        let snapshot = initializer().resolve(Some("retro"), &overrides).unwrap();
        assert_eq!(snapshot.max_cycles, 8);
        assert_eq!(snapshot.starting_agent, "alice");
    }

    #[test]
    fn override_starting_agent_must_participate() {
        let overrides = Overrides {
            max_cycles: None,
            starting_agent: Some("mallory".into()),
        };
        let err = initializer()
            .resolve(Some("standup"), &overrides)
            .unwrap_err();
        assert!(matches!(err, InitError::InvalidOverride(_)));
    }

    #[test]
    fn unknown_scenario_is_rejected() {
        let err = initializer()
            .resolve(Some("missing"), &Overrides::default())
            .unwrap_err();
        assert_eq!(err, InitError::UnknownScenario("missing".into()));
    }

    #[test]
    fn prompts_render_with_tool_names() {
        let init = initializer();
        let snapshot = init.resolve(None, &Overrides::default()).unwrap();
        let tools = HashMap::from([("alice".to_string(), vec!["echo".to_string()])]);
        let agents = init.build_agents(&snapshot, &tools, &StubFactory);
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].rendered_system_prompt, "You are Alice. Tools: echo.");
        assert_eq!(agents[1].rendered_system_prompt, "You are Bob. Tools: .");
    }

    #[test]
    fn opener_prefers_scenario_first_message() {
        let init = initializer();
        let snapshot = init.resolve(Some("retro"), &Overrides::default()).unwrap();
        let state = init.seed_state(snapshot);
        let opener = &state.messages()[0];
        assert_eq!(opener.role, Role::Human);
        assert_eq!(opener.content, "What went wrong?");
        assert_eq!(opener.author, "bob");

        let snapshot = init.resolve(None, &Overrides::default()).unwrap();
        let state = init.seed_state(snapshot);
        assert_eq!(state.messages()[0].content, "Please begin.");
    }
}
