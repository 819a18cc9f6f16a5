//! The conversation driver.
//!
//! An [`Orchestrator`] owns one conversation at a time: it initializes state
//! from a validated [`RootConfig`], drives agents through strict round-robin
//! turns, consults the cycle tracker after every turn, and reacts to the
//! command surface (`start`, `run_cycles`, `pause`, `resume`, `stop`,
//! `status`, scenario listing, endpoint testing, tool status/restart).
//!
//! Concurrency model: a single serial driver executes turns — the `drive`
//! lock guarantees one run loop at a time — while state lives behind a short
//! lock so status queries never wait on a model round-trip. `stop` signals
//! the conversation-scoped cancellation token; in-flight awaits unwind and
//! the terminated phase bars any further appends. Pause is cooperative: the
//! current turn completes and the loop holds at the next turn boundary until
//! resume.
//!
//! # Example
//!
//! ```rust,no_run
//! use colloquy::orchestrator::Orchestrator;
//! use colloquy::init::Overrides;
//! use std::sync::Arc;
//!
//! # async fn example(config: colloquy::config::RootConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Arc::new(Orchestrator::new(config));
//! orchestrator.start_global_tool_servers().await;
//!
//! let receipt = orchestrator.start(None, Overrides::default()).await?;
//! println!("conversation {} started", receipt.conversation_id);
//!
//! let outcome = orchestrator.run_cycles(None).await?;
//! println!("ended after {} cycles: {:?}", outcome.current_cycle, outcome.termination_reason);
//! # Ok(())
//! # }
//! ```

use crate::colloquy::agent::AgentRuntime;
use crate::colloquy::clients::ollama::OllamaClientFactory;
use crate::colloquy::config::{ConfigError, ModelEndpoint, RootConfig, ScenarioDescriptor};
use crate::colloquy::cycle::TerminationReason;
use crate::colloquy::event::{ConversationEvent, EventBus, LifecycleKind};
use crate::colloquy::init::{InitError, Initializer, Overrides};
use crate::colloquy::model::ModelClientFactory;
use crate::colloquy::prompt::{DefaultPromptRenderer, PromptRenderer};
use crate::colloquy::state::{Phase, SharedState, StatusSnapshot};
use crate::colloquy::thought_filter::ThoughtDelimiters;
use crate::colloquy::tool_proxy::ToolError;
use crate::colloquy::tool_registry::{ServerReport, ServerSpec, ToolRegistry};
use crate::colloquy::turn::{TurnExecutor, TurnOutcome};
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long in-flight work has to observe a stop signal.
pub const CANCELLATION_GRACE: Duration = Duration::from_millis(500);

/// Command rejections and start-time failures.
#[derive(Debug, Clone)]
pub enum CommandError {
    AlreadyRunning,
    NotRunning,
    InvalidOverride(String),
    UnknownScenario(String),
    ConfigInvalid(ConfigError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::AlreadyRunning => write!(f, "a conversation is already running"),
            CommandError::NotRunning => write!(f, "no conversation is running"),
            CommandError::InvalidOverride(detail) => write!(f, "invalid override: {detail}"),
            CommandError::UnknownScenario(name) => write!(f, "unknown scenario '{name}'"),
            CommandError::ConfigInvalid(err) => write!(f, "invalid configuration: {err}"),
        }
    }
}

impl Error for CommandError {}

impl From<InitError> for CommandError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::UnknownScenario(name) => CommandError::UnknownScenario(name),
            InitError::InvalidOverride(detail) => CommandError::InvalidOverride(detail),
            InitError::Config(config) => CommandError::ConfigInvalid(config),
        }
    }
}

/// Result of a successful `start`.
#[derive(Debug, Clone, Serialize)]
pub struct StartReceipt {
    pub conversation_id: Uuid,
    pub participating_agents: Vec<String>,
    pub max_cycles: u32,
}

/// Result of `run_cycles`.
#[derive(Debug, Clone, Serialize)]
pub struct ContinueReceipt {
    pub current_cycle: u32,
    pub terminated: bool,
    pub termination_reason: Option<String>,
}

/// Result of `pause` / `resume` / `stop`.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReceipt {
    pub phase: Phase,
}

/// Result of `test_model_endpoint`.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointTestReport {
    pub ok: bool,
    pub detail: String,
    pub available_models: Vec<String>,
}

pub struct Orchestrator {
    config: Arc<RootConfig>,
    factory: Arc<dyn ModelClientFactory>,
    renderer: Arc<dyn PromptRenderer>,
    delimiters: Arc<ThoughtDelimiters>,
    events: Arc<EventBus>,
    registry: Arc<ToolRegistry>,
    state: SharedState,
    agents: Mutex<HashMap<String, Arc<AgentRuntime>>>,
    cancel: Mutex<CancellationToken>,
    pause: watch::Sender<bool>,
    /// Serializes run loops: one turn at a time, one driver at a time.
    drive: Mutex<()>,
    health_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: RootConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ToolRegistry::new(events.clone()));
        let (pause, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            factory: Arc::new(OllamaClientFactory),
            renderer: Arc::new(DefaultPromptRenderer),
            delimiters: ThoughtDelimiters::standard(),
            events,
            registry,
            state: Arc::new(Mutex::new(None)),
            agents: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            pause,
            drive: Mutex::new(()),
            health_task: std::sync::Mutex::new(None),
        }
    }

    /// Replace the model-client factory (tests inject scripted clients here).
    pub fn with_factory(mut self, factory: Arc<dyn ModelClientFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Substitute the thought-delimiter policy.
    pub fn with_delimiters(mut self, delimiters: Arc<ThoughtDelimiters>) -> Self {
        self.delimiters = delimiters;
        self
    }

    /// The event bus observers subscribe to.
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// The tool registry (host-level access for global servers).
    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    /// Launch the globally-configured tool servers and the health monitor.
    /// Failures are advisory: the affected server stays stopped.
    pub async fn start_global_tool_servers(&self) {
        for server in &self.config.tool_servers.global {
            let spec = ServerSpec::new(&server.name, &server.command)
                .with_args(server.args.clone())
                .with_env(server.env.clone());
            if let Err(err) = self.registry.start(spec).await {
                log::warn!("global tool server '{}' unavailable: {}", server.name, err);
            }
        }
        self.ensure_health_monitor();
    }

    fn ensure_health_monitor(&self) {
        let mut slot = self.health_task.lock().expect("health task slot poisoned");
        if slot.is_none() {
            *slot = Some(self.registry.spawn_health_monitor());
        }
    }

    /// Begin a conversation: resolve the scenario, start agent-scoped tool
    /// servers, render prompts, seed the opening message, and enter
    /// `Running`. Fails with `AlreadyRunning` while a conversation is live.
    pub async fn start(
        &self,
        scenario: Option<&str>,
        overrides: Overrides,
    ) -> Result<StartReceipt, CommandError> {
        let _drive = self.drive.try_lock().map_err(|_| CommandError::AlreadyRunning)?;
        {
            let guard = self.state.lock().await;
            if let Some(state) = guard.as_ref() {
                if state.phase == Phase::Running || state.phase == Phase::Paused {
                    return Err(CommandError::AlreadyRunning);
                }
            }
        }

        let initializer = Initializer::new(self.config.clone(), self.renderer.clone());
        let snapshot = initializer.resolve(scenario, &overrides)?;

        // A previous conversation's scoped servers have no business here.
        self.registry.stop_agent_scoped().await;
        for spec in initializer.agent_server_specs(&snapshot) {
            let name = spec.registered_name();
            if let Err(err) = self.registry.start(spec).await {
                log::warn!("agent tool server '{}' unavailable: {}", name, err);
            }
        }
        self.ensure_health_monitor();

        let mut tools_by_agent: HashMap<String, Vec<String>> = HashMap::new();
        for agent_id in &snapshot.participating_agents {
            let names = self
                .registry
                .tools_for_agent(agent_id)
                .await
                .into_iter()
                .map(|handle| handle.tool.name)
                .collect();
            tools_by_agent.insert(agent_id.clone(), names);
        }

        let runtimes =
            initializer.build_agents(&snapshot, &tools_by_agent, self.factory.as_ref());
        {
            let mut agents = self.agents.lock().await;
            agents.clear();
            for runtime in runtimes {
                agents.insert(runtime.id.clone(), Arc::new(runtime));
            }
        }

        let mut state = initializer.seed_state(snapshot);
        state.phase = Phase::Running;
        let receipt = StartReceipt {
            conversation_id: state.id,
            participating_agents: state.tracker.participating().to_vec(),
            max_cycles: state.scenario.max_cycles,
        };

        *self.cancel.lock().await = CancellationToken::new();
        let _ = self.pause.send(false);
        *self.state.lock().await = Some(state);

        log::info!(
            "conversation {} started with {} participants",
            receipt.conversation_id,
            receipt.participating_agents.len()
        );
        self.events.publish(ConversationEvent::Lifecycle {
            kind: LifecycleKind::Started,
            detail: format!(
                "conversation {} ({} agents, max {} cycles)",
                receipt.conversation_id,
                receipt.participating_agents.len(),
                receipt.max_cycles
            ),
        });

        Ok(receipt)
    }

    /// Drive the run loop for up to `cycles` full cycles (all of the
    /// remaining conversation when `None`), or until termination.
    pub async fn run_cycles(&self, cycles: Option<u32>) -> Result<ContinueReceipt, CommandError> {
        let _drive = self.drive.lock().await;

        let (cancel, start_cycle) = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(CommandError::NotRunning)?;
            if state.phase == Phase::Terminated {
                return Err(CommandError::NotRunning);
            }
            (
                self.cancel.lock().await.clone(),
                state.tracker.current_cycle(),
            )
        };
        let target_cycle = cycles.map(|n| start_cycle + n.max(1));

        let executor = TurnExecutor {
            events: self.events.clone(),
            registry: self.registry.clone(),
            delimiters: self.delimiters.clone(),
            cancel: cancel.clone(),
        };
        let mut pause_rx = self.pause.subscribe();

        'turns: loop {
            // Pause gate: hold at the turn boundary until resumed or stopped.
            loop {
                if cancel.is_cancelled() {
                    break 'turns;
                }
                if !*pause_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break 'turns,
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            break 'turns;
                        }
                    }
                }
            }

            let next_agent = {
                let guard = self.state.lock().await;
                let Some(state) = guard.as_ref() else {
                    break 'turns;
                };
                if state.phase == Phase::Terminated {
                    break 'turns;
                }
                if let Some(target) = target_cycle {
                    if state.tracker.current_cycle() >= target {
                        break 'turns;
                    }
                }
                state.next_agent.clone()
            };

            let agent = {
                let agents = self.agents.lock().await;
                agents.get(&next_agent).cloned()
            };
            let Some(agent) = agent else {
                log::error!("no runtime for next agent '{}'", next_agent);
                self.end_conversation(TerminationReason::AgentError).await;
                break 'turns;
            };

            match executor.execute(&agent, &self.state).await {
                TurnOutcome::Completed { final_content } => {
                    let ended = {
                        let mut guard = self.state.lock().await;
                        let Some(state) = guard.as_mut() else {
                            break 'turns;
                        };
                        if state.phase == Phase::Terminated {
                            break 'turns;
                        }
                        match state.tracker.check_termination(&final_content) {
                            Some(reason) => {
                                state.terminate(reason.clone());
                                Some(reason)
                            }
                            None => {
                                state.advance_next_agent();
                                None
                            }
                        }
                    };
                    if let Some(reason) = ended {
                        self.publish_ended(&reason).await;
                        break 'turns;
                    }
                }
                TurnOutcome::Fatal(error) => {
                    log::error!("conversation ending after model failure: {}", error);
                    self.end_conversation(TerminationReason::AgentError).await;
                    break 'turns;
                }
                TurnOutcome::Cancelled => break 'turns,
            }
        }

        let receipt = {
            let guard = self.state.lock().await;
            match guard.as_ref() {
                Some(state) => ContinueReceipt {
                    current_cycle: state.tracker.current_cycle(),
                    terminated: state.phase == Phase::Terminated,
                    termination_reason: state
                        .termination
                        .as_ref()
                        .map(|t| t.reason.to_string()),
                },
                None => ContinueReceipt {
                    current_cycle: 0,
                    terminated: true,
                    termination_reason: None,
                },
            }
        };
        if receipt.terminated {
            self.registry.stop_agent_scoped().await;
        }
        Ok(receipt)
    }

    /// Run the conversation to termination. Equivalent to `run_cycles(None)`.
    pub async fn run(&self) -> Result<ContinueReceipt, CommandError> {
        self.run_cycles(None).await
    }

    /// Cooperative pause: the in-flight turn completes, no new turn starts.
    pub async fn pause(&self) -> Result<PhaseReceipt, CommandError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(CommandError::NotRunning)?;
        if state.phase != Phase::Running {
            return Err(CommandError::NotRunning);
        }
        state.phase = Phase::Paused;
        let _ = self.pause.send(true);
        self.events.publish(ConversationEvent::Lifecycle {
            kind: LifecycleKind::Paused,
            detail: "conversation paused".into(),
        });
        Ok(PhaseReceipt { phase: Phase::Paused })
    }

    /// Resume at the next turn boundary.
    pub async fn resume(&self) -> Result<PhaseReceipt, CommandError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(CommandError::NotRunning)?;
        if state.phase != Phase::Paused {
            return Err(CommandError::NotRunning);
        }
        state.phase = Phase::Running;
        let _ = self.pause.send(false);
        self.events.publish(ConversationEvent::Lifecycle {
            kind: LifecycleKind::Resumed,
            detail: "conversation resumed".into(),
        });
        Ok(PhaseReceipt { phase: Phase::Running })
    }

    /// Stop the conversation: cancel in-flight work and terminate. The
    /// `ended` event is published immediately — well inside
    /// [`CANCELLATION_GRACE`].
    pub async fn stop(&self) -> Result<PhaseReceipt, CommandError> {
        {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(CommandError::NotRunning)?;
            if state.phase == Phase::Terminated {
                return Ok(PhaseReceipt {
                    phase: Phase::Terminated,
                });
            }
        }

        self.cancel.lock().await.cancel();
        let _ = self.pause.send(false);

        {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut() {
                state.terminate(TerminationReason::Stopped);
            }
        }
        self.publish_ended(&TerminationReason::Stopped).await;

        Ok(PhaseReceipt {
            phase: Phase::Terminated,
        })
    }

    /// Snapshot of the current conversation, or `None` before the first
    /// `start`.
    pub async fn status(&self) -> Option<StatusSnapshot> {
        let guard = self.state.lock().await;
        guard.as_ref().map(|state| state.snapshot())
    }

    /// Copy of the conversation history. Exporters build transcripts from
    /// this; the live state stays exclusive to the driver.
    pub async fn transcript(&self) -> Vec<crate::colloquy::message::Message> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|state| state.messages().to_vec())
            .unwrap_or_default()
    }

    /// Scenario descriptors, first entry being the default.
    pub fn list_scenarios(&self) -> Vec<ScenarioDescriptor> {
        self.config.scenario_descriptors()
    }

    /// Minimal connectivity and model-listing probe for an endpoint.
    pub async fn test_model_endpoint(&self, endpoint: &ModelEndpoint) -> EndpointTestReport {
        let client = self.factory.create(endpoint);
        match client.verify().await {
            Ok(probe) => EndpointTestReport {
                ok: true,
                detail: format!(
                    "endpoint serves '{}' ({} models available)",
                    endpoint.model_name,
                    probe.available_models.len()
                ),
                available_models: probe.available_models,
            },
            Err(err) => EndpointTestReport {
                ok: false,
                detail: err.to_string(),
                available_models: Vec::new(),
            },
        }
    }

    /// Status of every tool server, or of one by name.
    pub async fn tool_status(&self, name: Option<&str>) -> Vec<ServerReport> {
        let reports = self.registry.statuses().await;
        match name {
            Some(wanted) => reports.into_iter().filter(|r| r.name == wanted).collect(),
            None => reports,
        }
    }

    /// Restart a tool server by registered name.
    pub async fn restart_tool(&self, name: &str) -> Result<Vec<String>, ToolError> {
        let handles = self.registry.restart(name).await?;
        Ok(handles.into_iter().map(|h| h.tool.name).collect())
    }

    async fn end_conversation(&self, reason: TerminationReason) {
        {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut() {
                state.terminate(reason.clone());
            }
        }
        self.publish_ended(&reason).await;
    }

    async fn publish_ended(&self, reason: &TerminationReason) {
        self.events.publish(ConversationEvent::Lifecycle {
            kind: LifecycleKind::Ended,
            detail: reason.to_string(),
        });
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
