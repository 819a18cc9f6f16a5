//! Tool-server registry: lifecycle, scoping, routing, and health.
//!
//! The registry owns every running tool server for a host process. Servers
//! are either **global** (visible to all agents) or **agent-scoped**
//! (registered as `{agent_id}_{base_name}` so names never collide across
//! agents). [`ToolRegistry::tools_for_agent`] computes the union an agent
//! may call; when a tool name exists in both a global and an agent-scoped
//! server, the agent-scoped one wins and a warning is logged.
//!
//! Tool availability is advisory: a server that fails to start stays
//! `Stopped`, is excluded from routing, and the conversation proceeds
//! without it.
//!
//! A background health task probes `Ready` servers with a lightweight
//! `tools/list` request. Failures mark the server `Unhealthy` and retry with
//! exponential backoff up to a cap, after which the server waits for an
//! explicit [`restart`](ToolRegistry::restart).

use crate::colloquy::event::{ConversationEvent, ErrorEventKind, EventBus, LifecycleKind};
use crate::colloquy::model::ToolSchema;
use crate::colloquy::tool_proxy::{
    ServerConnection, StdioToolServer, ToolCallOutcome, ToolDescriptor, ToolError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default deadline for the initialize handshake.
pub const DEFAULT_STARTUP_DEADLINE: Duration = Duration::from_secs(2);
/// Default grace period before a stopping server is force-terminated.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
/// Default interval between health probes.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for a single health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff after the first health failure; doubles per consecutive failure.
const HEALTH_BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Consecutive failures after which an unhealthy server is left alone.
const HEALTH_MAX_RETRIES: u32 = 5;

/// Who may see a server's tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolScope {
    Global,
    Agent(String),
}

/// Static description of a tool server to launch.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub scope: ToolScope,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub startup_deadline: Duration,
    pub grace_period: Duration,
}

impl ServerSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: ToolScope::Global,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            startup_deadline: DEFAULT_STARTUP_DEADLINE,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Scope the server to one agent. Its registry name becomes
    /// `{agent_id}_{base_name}`.
    pub fn scoped_to(mut self, agent_id: impl Into<String>) -> Self {
        self.scope = ToolScope::Agent(agent_id.into());
        self
    }

    /// Name the server is registered under.
    pub fn registered_name(&self) -> String {
        match &self.scope {
            ToolScope::Global => self.name.clone(),
            ToolScope::Agent(agent_id) => format!("{}_{}", agent_id, self.name),
        }
    }
}

/// Runtime status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Ready,
    Unhealthy,
}

/// A callable tool together with the server that owns it.
#[derive(Debug, Clone)]
pub struct ToolHandle {
    /// Registered name of the owning server.
    pub server: String,
    pub scope: ToolScope,
    pub tool: ToolDescriptor,
}

impl ToolHandle {
    /// Schema surfaced to the model for this tool.
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.tool.name.clone(),
            description: self.tool.description.clone(),
            input_schema: self.tool.input_schema.clone(),
        }
    }
}

/// Snapshot of one server for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub name: String,
    pub scope: ToolScope,
    pub status: ServerStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub tools: Vec<String>,
}

struct ServerEntry {
    spec: ServerSpec,
    status: RwLock<ServerStatus>,
    connection: RwLock<Option<Arc<dyn ServerConnection>>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    consecutive_failures: AtomicU32,
    next_probe_at: RwLock<Option<Instant>>,
}

impl ServerEntry {
    fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            status: RwLock::new(ServerStatus::Starting),
            connection: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            last_health_check: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            next_probe_at: RwLock::new(None),
        }
    }
}

/// Registry of tool servers shared by the orchestrator and turn executor.
pub struct ToolRegistry {
    servers: RwLock<HashMap<String, Arc<ServerEntry>>>,
    events: Arc<EventBus>,
    health_interval: Duration,
}

impl ToolRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            events,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Spawn the server process described by `spec`, perform its handshake,
    /// and enumerate its tools.
    ///
    /// On failure the server is recorded as `Stopped`, an error event is
    /// published, and routing excludes it — the caller surfaces a warning
    /// but does not abort the conversation.
    pub async fn start(&self, spec: ServerSpec) -> Result<Vec<ToolHandle>, ToolError> {
        let name = spec.registered_name();
        {
            let servers = self.servers.read().await;
            if let Some(existing) = servers.get(&name) {
                let status = *existing.status.read().await;
                if status != ServerStatus::Stopped {
                    return Err(ToolError::SpawnFailed(format!(
                        "server '{name}' is already registered ({status:?})"
                    )));
                }
            }
        }

        let spawned = StdioToolServer::spawn(
            &name,
            &spec.command,
            &spec.args,
            &spec.env,
            spec.startup_deadline,
        )
        .await;

        match spawned {
            Ok(server) => self.attach(spec, Arc::new(server)).await,
            Err(err) => {
                let entry = Arc::new(ServerEntry::new(spec));
                *entry.status.write().await = ServerStatus::Stopped;
                self.servers.write().await.insert(name.clone(), entry);
                log::warn!("tool server '{}' failed to start: {}", name, err);
                self.events.publish(ConversationEvent::Error {
                    kind: ErrorEventKind::Tool,
                    agent_id: None,
                    message: format!("tool server '{name}' failed to start: {err}"),
                });
                Err(err)
            }
        }
    }

    /// Register an already-connected server.
    ///
    /// This is the seam [`start`](ToolRegistry::start) goes through after
    /// spawning; alternative transports and tests use it directly.
    pub async fn attach(
        &self,
        spec: ServerSpec,
        connection: Arc<dyn ServerConnection>,
    ) -> Result<Vec<ToolHandle>, ToolError> {
        let name = spec.registered_name();
        let entry = Arc::new(ServerEntry::new(spec));

        let tools = connection.list_tools().await?;
        *entry.connection.write().await = Some(connection);
        *entry.tools.write().await = tools.clone();
        *entry.status.write().await = ServerStatus::Ready;
        *entry.last_health_check.write().await = Some(Utc::now());

        let scope = entry.spec.scope.clone();
        self.servers.write().await.insert(name.clone(), entry);

        log::info!("tool server '{}' ready with {} tools", name, tools.len());
        self.events.publish(ConversationEvent::Lifecycle {
            kind: LifecycleKind::Started,
            detail: format!("tool server '{}' ready ({} tools)", name, tools.len()),
        });

        Ok(tools
            .into_iter()
            .map(|tool| ToolHandle {
                server: name.clone(),
                scope: scope.clone(),
                tool,
            })
            .collect())
    }

    /// Gracefully stop a server and remove it from the registry.
    pub async fn stop(&self, name: &str) -> bool {
        let entry = self.servers.write().await.remove(name);
        match entry {
            Some(entry) => {
                let connection = entry.connection.write().await.take();
                if let Some(connection) = connection {
                    connection.shutdown(entry.spec.grace_period).await;
                }
                log::info!("tool server '{}' stopped", name);
                self.events.publish(ConversationEvent::Lifecycle {
                    kind: LifecycleKind::Stopped,
                    detail: format!("tool server '{name}' stopped"),
                });
                true
            }
            None => {
                log::warn!("tool server '{}' not found", name);
                false
            }
        }
    }

    /// Stop then start a server with its original spec.
    pub async fn restart(&self, name: &str) -> Result<Vec<ToolHandle>, ToolError> {
        let spec = {
            let servers = self.servers.read().await;
            servers
                .get(name)
                .map(|entry| entry.spec.clone())
                .ok_or_else(|| ToolError::UnknownTool(format!("server '{name}'")))?
        };
        self.stop(name).await;
        self.start(spec).await
    }

    /// Stop every registered server. Called on host shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    /// Stop every agent-scoped server. Scoped servers live for one
    /// conversation; global servers belong to the host and survive.
    pub async fn stop_agent_scoped(&self) {
        let names: Vec<String> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .filter(|(_, entry)| matches!(entry.spec.scope, ToolScope::Agent(_)))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            self.stop(&name).await;
        }
    }

    /// All tools visible to `agent_id`: the union of global servers and
    /// servers scoped to that agent. Agent-scoped tools shadow global tools
    /// of the same name.
    pub async fn tools_for_agent(&self, agent_id: &str) -> Vec<ToolHandle> {
        let servers = self.servers.read().await;
        let mut by_name: HashMap<String, ToolHandle> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        let mut visible: Vec<&Arc<ServerEntry>> = Vec::new();
        let mut scoped: Vec<&Arc<ServerEntry>> = Vec::new();
        for entry in servers.values() {
            match &entry.spec.scope {
                ToolScope::Global => visible.push(entry),
                ToolScope::Agent(owner) if owner == agent_id => scoped.push(entry),
                ToolScope::Agent(_) => {}
            }
        }

        for entry in visible.into_iter().chain(scoped) {
            if *entry.status.read().await != ServerStatus::Ready {
                continue;
            }
            let name = entry.spec.registered_name();
            for tool in entry.tools.read().await.iter() {
                let handle = ToolHandle {
                    server: name.clone(),
                    scope: entry.spec.scope.clone(),
                    tool: tool.clone(),
                };
                if let Some(previous) = by_name.insert(tool.name.clone(), handle) {
                    log::warn!(
                        "tool '{}' from server '{}' shadowed by agent-scoped server '{}'",
                        tool.name,
                        previous.server,
                        name
                    );
                } else {
                    order.push(tool.name.clone());
                }
            }
        }

        order
            .into_iter()
            .filter_map(|tool_name| by_name.remove(&tool_name))
            .collect()
    }

    /// Route a tool call for `agent_id` to the owning server.
    ///
    /// The registry lock is released before the subprocess round-trip.
    pub async fn call(
        &self,
        agent_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolCallOutcome, ToolError> {
        let handle = self
            .tools_for_agent(agent_id)
            .await
            .into_iter()
            .find(|h| h.tool.name == tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        let connection = {
            let servers = self.servers.read().await;
            let entry = servers
                .get(&handle.server)
                .ok_or_else(|| ToolError::Transport(format!("server '{}' gone", handle.server)))?;
            let conn = entry.connection.read().await.clone();
            conn.ok_or_else(|| ToolError::Transport(format!("server '{}' not connected", handle.server)))?
        };

        connection.call_tool(tool_name, arguments, deadline).await
    }

    /// Status snapshots for every registered server.
    pub async fn statuses(&self) -> Vec<ServerReport> {
        let servers = self.servers.read().await;
        let mut reports = Vec::with_capacity(servers.len());
        for (name, entry) in servers.iter() {
            reports.push(ServerReport {
                name: name.clone(),
                scope: entry.spec.scope.clone(),
                status: *entry.status.read().await,
                last_health_check: *entry.last_health_check.read().await,
                tools: entry
                    .tools
                    .read()
                    .await
                    .iter()
                    .map(|t| t.name.clone())
                    .collect(),
            });
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Spawn the periodic health monitor. The task holds no registry lock
    /// across probe round-trips and runs until aborted.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.probe_all().await;
            }
        })
    }

    async fn probe_all(&self) {
        let entries: Vec<(String, Arc<ServerEntry>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };

        for (name, entry) in entries {
            let status = *entry.status.read().await;
            match status {
                ServerStatus::Ready => {}
                ServerStatus::Unhealthy => {
                    let failures = entry.consecutive_failures.load(Ordering::Relaxed);
                    if failures > HEALTH_MAX_RETRIES {
                        continue;
                    }
                    let due = (*entry.next_probe_at.read().await)
                        .map(|at| Instant::now() >= at)
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                }
                _ => continue,
            }

            let connection = entry.connection.read().await.clone();
            let Some(connection) = connection else {
                continue;
            };

            let probe = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, connection.list_tools()).await;
            match probe {
                Ok(Ok(tools)) => {
                    *entry.tools.write().await = tools;
                    *entry.last_health_check.write().await = Some(Utc::now());
                    entry.consecutive_failures.store(0, Ordering::Relaxed);
                    *entry.next_probe_at.write().await = None;
                    if status == ServerStatus::Unhealthy {
                        *entry.status.write().await = ServerStatus::Ready;
                        log::info!("tool server '{}' recovered", name);
                        self.events.publish(ConversationEvent::Lifecycle {
                            kind: LifecycleKind::Resumed,
                            detail: format!("tool server '{name}' recovered"),
                        });
                    }
                }
                Ok(Err(err)) => self.record_probe_failure(&name, &entry, err.to_string()).await,
                Err(_) => {
                    self.record_probe_failure(&name, &entry, "health probe timed out".into())
                        .await
                }
            }
        }
    }

    async fn record_probe_failure(&self, name: &str, entry: &ServerEntry, detail: String) {
        let failures = entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let backoff = HEALTH_BACKOFF_BASE * 2u32.saturating_pow(failures.saturating_sub(1).min(8));
        *entry.next_probe_at.write().await = Some(Instant::now() + backoff);
        *entry.last_health_check.write().await = Some(Utc::now());

        let was_ready = {
            let mut status = entry.status.write().await;
            let was_ready = *status == ServerStatus::Ready;
            *status = ServerStatus::Unhealthy;
            was_ready
        };
        if was_ready {
            log::warn!("tool server '{}' unhealthy: {}", name, detail);
            self.events.publish(ConversationEvent::Error {
                kind: ErrorEventKind::Tool,
                agent_id: None,
                message: format!("tool server '{name}' unhealthy: {detail}"),
            });
        } else if failures > HEALTH_MAX_RETRIES {
            log::warn!(
                "tool server '{}' still unhealthy after {} retries; awaiting restart",
                name,
                HEALTH_MAX_RETRIES
            );
        }
    }
}
