//! Stdio transport for external tool servers.
//!
//! A tool server is a child process speaking newline-framed JSON-RPC 2.0 on
//! stdin/stdout: an `initialize` handshake yielding capabilities, a
//! `tools/list` exchange enumerating callable tools, and `tools/call` for
//! invocation. The registry only depends on the [`ServerConnection`] trait,
//! so tests (and alternative transports) can substitute the wire layer.
//!
//! Child processes are spawned with `kill_on_drop`, so no tool server
//! outlives the registry on any exit path, crashes included.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Default deadline for requests that do not carry their own.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures in the tool subsystem.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// The server process could not be started or failed its handshake.
    SpawnFailed(String),
    /// A request ran past its deadline.
    Timeout,
    /// The process died or its pipes broke.
    Transport(String),
    /// The server answered with something that is not valid protocol.
    Protocol(String),
    /// No server owns a tool with this name.
    UnknownTool(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::SpawnFailed(detail) => write!(f, "tool server spawn failed: {detail}"),
            ToolError::Timeout => write!(f, "tool call timed out"),
            ToolError::Transport(detail) => write!(f, "tool transport error: {detail}"),
            ToolError::Protocol(detail) => write!(f, "tool protocol error: {detail}"),
            ToolError::UnknownTool(name) => write!(f, "unknown tool: {name}"),
        }
    }
}

impl Error for ToolError {}

impl ToolError {
    /// Stable kind label used in error surfaces (`timeout`, `transport`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::SpawnFailed(_) => "spawn",
            ToolError::Timeout => "timeout",
            ToolError::Transport(_) => "transport",
            ToolError::Protocol(_) => "protocol",
            ToolError::UnknownTool(_) => "unknown_tool",
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::Protocol(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification {
    jsonrpc: &'static str,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

impl JsonRpcResponse {
    fn into_result(self) -> Result<serde_json::Value, ToolError> {
        if let Some(err) = self.error {
            Err(ToolError::Protocol(format!(
                "JSON-RPC error {}: {}",
                err.code, err.message
            )))
        } else {
            Ok(self.result.unwrap_or(serde_json::Value::Null))
        }
    }
}

/// A tool as enumerated by its server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema-like shape of the arguments object.
    #[serde(default = "default_schema", alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

/// One element of a tool result: text or a structured value.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Result of a `tools/call` exchange.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallOutcome {
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, alias = "isError")]
    pub is_error: bool,
}

impl ToolCallOutcome {
    /// Flatten the ordered parts into text for a tool message.
    pub fn rendered(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| {
                part.text.clone().or_else(|| {
                    part.data
                        .as_ref()
                        .map(|v| serde_json::to_string(v).unwrap_or_default())
                })
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Logical operations the registry needs from a running server.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolCallOutcome, ToolError>;

    /// Graceful close: signal shutdown, wait up to `grace`, then terminate.
    async fn shutdown(&self, grace: Duration);
}

/// A spawned tool-server child process on newline-framed stdio JSON-RPC.
pub struct StdioToolServer {
    server_name: String,
    next_id: AtomicU64,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Option<Child>>,
}

impl StdioToolServer {
    /// Spawn the process and perform the `initialize` handshake, expecting
    /// the capability response within `startup_deadline`.
    pub async fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        startup_deadline: Duration,
    ) -> Result<Self, ToolError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        // Start from a scrubbed environment: essential system variables plus
        // whatever the server declaration explicitly configures.
        cmd.env_clear();
        for key in &["PATH", "HOME", "USER", "LANG", "TERM"] {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        for (key, val) in env {
            cmd.env(key, val);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::SpawnFailed(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::SpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::SpawnFailed("failed to capture stdout".into()))?;

        let server = Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(Some(child)),
        };

        server
            .initialize(startup_deadline)
            .await
            .map_err(|e| ToolError::SpawnFailed(format!("handshake failed: {e}")))?;

        Ok(server)
    }

    async fn initialize(&self, deadline: Duration) -> Result<(), ToolError> {
        let params = serde_json::json!({
            "protocol_version": "2024-11-05",
            "capabilities": {},
            "client_info": {
                "name": "colloquy",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let response = self
            .send_request("initialize", Some(params), deadline)
            .await?;
        log::debug!(
            "tool server '{}' initialized: {}",
            self.server_name,
            response
        );
        self.send_notification("notifications/initialized", None)
            .await?;
        Ok(())
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
        }

        let response = tokio::time::timeout(deadline, self.read_response(id))
            .await
            .map_err(|_| ToolError::Timeout)??;
        response.into_result()
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ToolError> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&notification)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read stdout lines until the response matching `expected_id` arrives.
    /// Log lines and unsolicited notifications are skipped.
    async fn read_response(&self, expected_id: u64) -> Result<JsonRpcResponse, ToolError> {
        let mut stdout = self.stdout.lock().await;
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = stdout.read_line(&mut buf).await?;
            if n == 0 {
                return Err(ToolError::Transport("server closed stdout".into()));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(expected_id) => return Ok(resp),
                Ok(resp) => {
                    log::debug!(
                        "tool server '{}': skipping JSON-RPC message with id {:?}",
                        self.server_name,
                        resp.id
                    );
                }
                Err(_) => {
                    log::debug!(
                        "tool server '{}': ignoring non-JSON-RPC line",
                        self.server_name
                    );
                }
            }
        }
    }
}

#[async_trait]
impl ServerConnection for StdioToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let result = self
            .send_request("tools/list", None, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        let tools_value = result
            .get("tools")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![]));
        let tools: Vec<ToolDescriptor> = serde_json::from_value(tools_value)
            .map_err(|e| ToolError::Protocol(format!("failed to parse tools list: {e}")))?;
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        deadline: Duration,
    ) -> Result<ToolCallOutcome, ToolError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self
            .send_request("tools/call", Some(params), deadline)
            .await?;
        let outcome: ToolCallOutcome = serde_json::from_value(result).unwrap_or_default();
        Ok(outcome)
    }

    async fn shutdown(&self, grace: Duration) {
        // Closing stdin is the graceful shutdown signal for a stdio peer.
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "tools/list".into(),
            params: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":7"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn response_result_parsing() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, Some(1));
        assert!(resp.into_result().is_ok());
    }

    #[test]
    fn response_error_parsing() {
        let json =
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn descriptor_accepts_both_schema_spellings() {
        let camel: ToolDescriptor = serde_json::from_str(
            r#"{"name":"echo","description":"Echo","inputSchema":{"type":"object","properties":{"x":{"type":"string"}}}}"#,
        )
        .unwrap();
        assert_eq!(camel.input_schema["properties"]["x"]["type"], "string");

        let snake: ToolDescriptor =
            serde_json::from_str(r#"{"name":"echo","input_schema":{"type":"object"}}"#).unwrap();
        assert_eq!(snake.input_schema["type"], "object");
        assert!(snake.description.is_empty());
    }

    #[test]
    fn outcome_rendering_joins_parts() {
        let outcome: ToolCallOutcome = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"line one"},{"type":"json","data":{"k":1}}],"isError":false}"#,
        )
        .unwrap();
        assert_eq!(outcome.rendered(), "line one\n{\"k\":1}");
        assert!(!outcome.is_error);
    }
}
