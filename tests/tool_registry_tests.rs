use async_trait::async_trait;
use colloquy::config::{ModelEndpoint, RootConfig};
use colloquy::event::{ConversationEvent, EventBus, EventObserver};
use colloquy::model::{
    EndpointProbe, ModelClient, ModelClientFactory, ModelError, ModelResponse, TokenSink,
    ToolSchema,
};
use colloquy::tool_proxy::{ContentPart, ServerConnection, ToolCallOutcome, ToolDescriptor, ToolError};
use colloquy::tool_registry::{ServerStatus, ToolRegistry};
use colloquy::{Message, Orchestrator, Overrides, Role, ServerSpec, ToolCall};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process stand-in for a tool server: one tool, fixed behavior.
struct FixedConnection {
    tool: &'static str,
    reply: ReplyMode,
    failing: AtomicBool,
}

enum ReplyMode {
    /// Echo the `x` argument back as text.
    EchoX,
    /// Always answer with this text.
    Text(&'static str),
}

impl FixedConnection {
    fn new(tool: &'static str, reply: ReplyMode) -> Arc<Self> {
        Arc::new(Self {
            tool,
            reply,
            failing: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ServerConnection for FixedConnection {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ToolError::Transport("connection lost".into()));
        }
        Ok(vec![ToolDescriptor {
            name: self.tool.to_string(),
            description: format!("The {} tool", self.tool),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"x": {"type": "string"}}
            }),
        }])
    }

    async fn call_tool(
        &self,
        _name: &str,
        arguments: serde_json::Value,
        _deadline: Duration,
    ) -> Result<ToolCallOutcome, ToolError> {
        let text = match &self.reply {
            ReplyMode::EchoX => arguments["x"].as_str().unwrap_or_default().to_string(),
            ReplyMode::Text(text) => text.to_string(),
        };
        Ok(ToolCallOutcome {
            content: vec![ContentPart {
                kind: "text".into(),
                text: Some(text),
                data: None,
            }],
            is_error: false,
        })
    }

    async fn shutdown(&self, _grace: Duration) {}
}

struct ScriptedClient {
    script: Mutex<VecDeque<ModelResponse>>,
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn generate(
        &self,
        _messages: &[Message],
        _tools: &[ToolSchema],
        sink: &dyn TokenSink,
    ) -> Result<ModelResponse, ModelError> {
        let response = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        if !response.content.is_empty() {
            sink.on_token(&response.content);
        }
        Ok(response)
    }

    async fn verify(&self) -> Result<EndpointProbe, ModelError> {
        Ok(EndpointProbe {
            available_models: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

struct PerModelFactory {
    scripts: Mutex<std::collections::HashMap<String, Arc<ScriptedClient>>>,
}

impl PerModelFactory {
    fn new(scripts: Vec<(&str, Vec<ModelResponse>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(model, steps)| {
                        (
                            model.to_string(),
                            Arc::new(ScriptedClient {
                                script: Mutex::new(steps.into_iter().collect()),
                            }),
                        )
                    })
                    .collect(),
            ),
        })
    }
}

impl ModelClientFactory for PerModelFactory {
    fn create(&self, endpoint: &ModelEndpoint) -> Arc<dyn ModelClient> {
        self.scripts
            .lock()
            .unwrap()
            .get(&endpoint.model_name)
            .cloned()
            .expect("no script for model")
    }
}

#[derive(Default)]
struct Collector {
    events: Mutex<Vec<ConversationEvent>>,
}

#[async_trait]
impl EventObserver for Collector {
    async fn on_event(&self, event: &ConversationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 3s");
}

fn config() -> RootConfig {
    serde_json::from_value(serde_json::json!({
        "agents": [
            {
                "id": "alice",
                "name": "Alice",
                "persona": "A pragmatic engineer.",
                "model": {"url": "http://mock", "model_name": "model-a"}
            },
            {
                "id": "bob",
                "name": "Bob",
                "persona": "A skeptical reviewer.",
                "model": {"url": "http://mock", "model_name": "model-b"}
            }
        ],
        "conversation": {"starting_agent": "alice", "max_cycles": 1},
        "initialization": {"first_message": "Please begin."}
    }))
    .unwrap()
}

#[tokio::test]
async fn tool_round_trip_within_one_turn() {
    let factory = PerModelFactory::new(vec![
        (
            "model-a",
            vec![
                ModelResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCall::new("echo", serde_json::json!({"x": "pong"}))],
                },
                ModelResponse {
                    content: "done".into(),
                    tool_calls: vec![],
                },
            ],
        ),
        (
            "model-b",
            vec![ModelResponse {
                content: "fine".into(),
                tool_calls: vec![],
            }],
        ),
    ]);

    let orchestrator = Arc::new(Orchestrator::new(config()).with_factory(factory));
    let collector = Arc::new(Collector::default());
    orchestrator.events().subscribe("test", collector.clone());

    orchestrator
        .registry()
        .attach(
            ServerSpec::new("echo-server", "unused"),
            FixedConnection::new("echo", ReplyMode::EchoX),
        )
        .await
        .unwrap();

    orchestrator.start(None, Overrides::default()).await.unwrap();
    let outcome = orchestrator.run().await.unwrap();
    assert!(outcome.terminated);

    // Opener, alice's tool-calling message, the tool result, alice's final
    // reply, bob's reply.
    let transcript = orchestrator.transcript().await;
    assert_eq!(transcript.len(), 5);

    let request = &transcript[1];
    assert_eq!(request.role, Role::Ai);
    assert_eq!(request.author, "alice");
    assert_eq!(request.tool_calls.len(), 1);
    assert_eq!(request.tool_calls[0].tool_name, "echo");

    let result = &transcript[2];
    assert_eq!(result.role, Role::Tool);
    assert_eq!(
        result.tool_call_id.as_deref(),
        Some(request.tool_calls[0].call_id.as_str())
    );
    assert_eq!(result.content, "pong");

    assert_eq!(transcript[3].content, "done");
    assert_eq!(transcript[4].author, "bob");

    // Exactly one agent_message event per turn, tool traffic observable.
    wait_until(|| {
        let events = collector.events.lock().unwrap();
        events
            .iter()
            .filter(|e| matches!(e, ConversationEvent::AgentMessage { .. }))
            .count()
            == 2
    })
    .await;
    let events = collector.events.lock().unwrap();
    let alice_messages = events
        .iter()
        .filter(|e| matches!(e, ConversationEvent::AgentMessage { agent_id, .. } if agent_id == "alice"))
        .count();
    assert_eq!(alice_messages, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConversationEvent::ToolCall { tool_name, .. } if tool_name == "echo")));
    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::ToolResult { tool_name, result_preview, .. }
            if tool_name == "echo" && result_preview == "pong"
    )));
    drop(events);

    let reports = orchestrator.tool_status(None).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "echo-server");
    assert_eq!(reports[0].tools, vec!["echo"]);
    assert!(orchestrator.tool_status(Some("missing")).await.is_empty());
}

#[tokio::test]
async fn agent_scoped_tools_shadow_global_ones() {
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(ToolRegistry::new(events));

    registry
        .attach(
            ServerSpec::new("search", "unused"),
            FixedConnection::new("lookup", ReplyMode::Text("global answer")),
        )
        .await
        .unwrap();
    registry
        .attach(
            ServerSpec::new("search", "unused").scoped_to("alice"),
            FixedConnection::new("lookup", ReplyMode::Text("alice answer")),
        )
        .await
        .unwrap();

    let alice_tools = registry.tools_for_agent("alice").await;
    assert_eq!(alice_tools.len(), 1);
    assert_eq!(alice_tools[0].server, "alice_search");

    let bob_tools = registry.tools_for_agent("bob").await;
    assert_eq!(bob_tools.len(), 1);
    assert_eq!(bob_tools[0].server, "search");

    let alice_result = registry
        .call(
            "alice",
            "lookup",
            serde_json::json!({}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(alice_result.rendered(), "alice answer");

    let bob_result = registry
        .call("bob", "lookup", serde_json::json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(bob_result.rendered(), "global answer");
}

#[tokio::test]
async fn unknown_tools_and_stopped_servers_are_invisible() {
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(ToolRegistry::new(events));

    registry
        .attach(
            ServerSpec::new("echo-server", "unused"),
            FixedConnection::new("echo", ReplyMode::EchoX),
        )
        .await
        .unwrap();

    let err = registry
        .call(
            "alice",
            "missing",
            serde_json::json!({}),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::UnknownTool(_)));

    assert!(registry.stop("echo-server").await);
    assert!(registry.tools_for_agent("alice").await.is_empty());

    let reports = registry.statuses().await;
    assert!(reports.is_empty());
}

#[tokio::test]
async fn health_monitor_marks_failing_servers_unhealthy() {
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(
        ToolRegistry::new(events.clone()).with_health_interval(Duration::from_millis(50)),
    );

    let connection = FixedConnection::new("echo", ReplyMode::EchoX);
    registry
        .attach(ServerSpec::new("echo-server", "unused"), connection.clone())
        .await
        .unwrap();

    let monitor = registry.spawn_health_monitor();
    connection.failing.store(true, Ordering::Relaxed);

    let mut went_unhealthy = false;
    for _ in 0..300 {
        let reports = registry.statuses().await;
        if reports
            .iter()
            .any(|r| r.name == "echo-server" && r.status == ServerStatus::Unhealthy)
        {
            went_unhealthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    monitor.abort();
    assert!(went_unhealthy, "server was never marked unhealthy");
}
