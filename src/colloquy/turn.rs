//! One agent turn, end to end.
//!
//! A turn announces itself, builds the agent's message view (its rendered
//! system prompt ahead of the shared non-thought history), invokes the model
//! through a [`ThoughtFilter`]-wrapped sink, resolves any requested tool
//! calls — concurrently within a batch, strictly ordered across batches —
//! and finishes with exactly one final `ai` message.
//!
//! Failure handling follows the taxonomy: per-turn timeouts synthesize an
//! `"[agent timed out]"` message and the conversation continues; tool
//! failures become tool-message text the model can react to; an unreachable
//! endpoint is fatal and bubbles up so the orchestrator can end the run.

use crate::colloquy::agent::AgentRuntime;
use crate::colloquy::event::{ConversationEvent, ErrorEventKind, EventBus};
use crate::colloquy::message::{Message, ToolCall};
use crate::colloquy::model::{ModelError, ModelResponse, ToolSchema};
use crate::colloquy::state::SharedState;
use crate::colloquy::thought_filter::{ThoughtDelimiters, ThoughtFilter};
use crate::colloquy::tool_registry::ToolRegistry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Synthetic content appended when a turn exceeds its deadline.
const TIMEOUT_MESSAGE: &str = "[agent timed out]";
/// Tool-message content injected when the tool loop hits its bound.
const ITERATION_LIMIT_MESSAGE: &str =
    "Tool iteration limit reached; conclude your response without further tool calls.";

/// How one turn ended.
pub(crate) enum TurnOutcome {
    /// A final message was appended; `final_content` feeds termination checks.
    Completed { final_content: String },
    /// The model endpoint is gone — the conversation must end.
    Fatal(ModelError),
    /// The conversation token fired mid-turn; nothing more will be appended.
    Cancelled,
}

enum BodyError {
    Fatal(ModelError),
    Timeout,
    /// The conversation terminated underneath the turn (stop raced us).
    Halted,
}

/// Executes turns against shared conversation state.
pub(crate) struct TurnExecutor {
    pub events: Arc<EventBus>,
    pub registry: Arc<ToolRegistry>,
    pub delimiters: Arc<ThoughtDelimiters>,
    pub cancel: CancellationToken,
}

impl TurnExecutor {
    pub async fn execute(&self, agent: &AgentRuntime, state: &SharedState) -> TurnOutcome {
        self.events.publish(ConversationEvent::TurnIndicator {
            agent_id: agent.id.clone(),
        });
        let started = Instant::now();

        let (turn_timeout, cycle) = {
            let guard = state.lock().await;
            let Some(state) = guard.as_ref() else {
                return TurnOutcome::Cancelled;
            };
            (state.scenario.turn_timeout, state.tracker.current_cycle())
        };

        let body = self.turn_body(agent, state);
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return TurnOutcome::Cancelled,
            result = tokio::time::timeout(turn_timeout, body) => result,
        };

        match outcome {
            Ok(Ok(final_content)) => {
                log::info!(
                    "agent '{}' completed turn in {:.2}s ({} chars)",
                    agent.id,
                    started.elapsed().as_secs_f64(),
                    final_content.len()
                );
                TurnOutcome::Completed { final_content }
            }
            Ok(Err(BodyError::Timeout)) | Err(_) => self.timeout_turn(agent, state, cycle).await,
            Ok(Err(BodyError::Fatal(error))) => self.fatal_turn(agent, state, error).await,
            Ok(Err(BodyError::Halted)) => TurnOutcome::Cancelled,
        }
    }

    /// The cancellable, deadline-bound part of the turn.
    async fn turn_body(
        &self,
        agent: &AgentRuntime,
        state: &SharedState,
    ) -> Result<String, BodyError> {
        let (mut view, tool_call_timeout, max_tool_iterations) = {
            let guard = state.lock().await;
            let Some(state) = guard.as_ref() else {
                return Err(BodyError::Halted);
            };
            let mut view =
                vec![Message::system("system", agent.rendered_system_prompt.clone())];
            view.extend(state.shared_view());
            (
                view,
                state.scenario.tool_call_timeout,
                state.scenario.max_tool_iterations,
            )
        };

        let handles = self.registry.tools_for_agent(&agent.id).await;
        let schemas: Vec<_> = handles.iter().map(|h| h.schema()).collect();

        let mut iteration: u32 = 0;
        loop {
            let (content, response) = self.invoke_model(agent, &view, &schemas).await?;

            if response.tool_calls.is_empty() {
                return self.finish_turn(agent, state, content).await;
            }

            if iteration >= max_tool_iterations {
                self.events.publish(ConversationEvent::Error {
                    kind: ErrorEventKind::Tool,
                    agent_id: Some(agent.id.clone()),
                    message: format!(
                        "tool loop exceeded {max_tool_iterations} iterations; forcing conclusion"
                    ),
                });
                let ai = Message::ai_with_tool_calls(
                    &agent.id,
                    content,
                    response.tool_calls.clone(),
                );
                let results: Vec<Message> = response
                    .tool_calls
                    .iter()
                    .map(|call| Message::tool_result(&call.call_id, ITERATION_LIMIT_MESSAGE))
                    .collect();
                self.append_batch(state, ai, results, &mut view).await?;

                // One last reply; any further tool calls are ignored.
                let (content, _) = self.invoke_model(agent, &view, &[]).await?;
                return self.finish_turn(agent, state, content).await;
            }
            iteration += 1;

            let ai = Message::ai_with_tool_calls(&agent.id, content, response.tool_calls.clone());
            let results = self
                .dispatch_tool_calls(agent, &response.tool_calls, tool_call_timeout)
                .await;
            self.append_batch(state, ai, results, &mut view).await?;
        }
    }

    /// Invoke the model once through a fresh thought filter, returning the
    /// cleaned content and the structured response.
    async fn invoke_model(
        &self,
        agent: &AgentRuntime,
        view: &[Message],
        schemas: &[ToolSchema],
    ) -> Result<(String, ModelResponse), BodyError> {
        let filter = ThoughtFilter::new(self.delimiters.clone(), agent.thinking_enabled)
            .with_events(self.events.clone(), agent.id.clone());

        let response = match agent.client.generate(view, schemas, &filter).await {
            Ok(response) => response,
            Err(err) if err.is_fatal() => return Err(BodyError::Fatal(err)),
            Err(ModelError::InvocationTimeout(_)) => return Err(BodyError::Timeout),
            Err(ModelError::MalformedResponse(detail)) => {
                // Best-effort recovery: surface the protocol error and carry
                // on with empty content.
                log::warn!("agent '{}' produced malformed output: {}", agent.id, detail);
                self.events.publish(ConversationEvent::Error {
                    kind: ErrorEventKind::Protocol,
                    agent_id: Some(agent.id.clone()),
                    message: detail,
                });
                ModelResponse::default()
            }
            Err(err) => return Err(BodyError::Fatal(err)),
        };

        let mut cleaned = filter.finish();
        if cleaned.is_empty() && !filter.saw_thought() {
            // The client did not stream; strip any thought artifacts from the
            // assembled content instead.
            cleaned = ThoughtFilter::scrub(&response.content, &self.delimiters);
        }
        Ok((cleaned.trim().to_string(), response))
    }

    /// Resolve one batch of tool calls concurrently, converting every
    /// failure into tool-message text so the model can react.
    async fn dispatch_tool_calls(
        &self,
        agent: &AgentRuntime,
        calls: &[ToolCall],
        deadline: std::time::Duration,
    ) -> Vec<Message> {
        let futures: Vec<_> = calls
            .iter()
            .map(|call| {
                self.events.publish(ConversationEvent::ToolCall {
                    agent_id: agent.id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: call.arguments.clone(),
                });
                let registry = Arc::clone(&self.registry);
                let agent_id = agent.id.clone();
                let call = call.clone();
                async move {
                    let started = Instant::now();
                    let result = registry
                        .call(&agent_id, &call.tool_name, call.arguments.clone(), deadline)
                        .await;
                    (call, result, started.elapsed())
                }
            })
            .collect();

        let resolved = futures_util::future::join_all(futures).await;

        resolved
            .into_iter()
            .map(|(call, result, elapsed)| {
                let text = match result {
                    Ok(outcome) if outcome.is_error => {
                        format!("Tool '{}' reported an error: {}", call.tool_name, outcome.rendered())
                    }
                    Ok(outcome) => outcome.rendered(),
                    Err(err) => format!("Tool '{}' failed ({}): {}", call.tool_name, err.kind(), err),
                };
                self.events.publish(ConversationEvent::ToolResult {
                    tool_name: call.tool_name.clone(),
                    result_preview: preview(&text),
                    duration_ms: elapsed.as_millis() as u64,
                });
                Message::tool_result(&call.call_id, text)
            })
            .collect()
    }

    /// Append an `ai` message and its tool results atomically, keeping the
    /// local view in sync.
    async fn append_batch(
        &self,
        state: &SharedState,
        ai: Message,
        results: Vec<Message>,
        view: &mut Vec<Message>,
    ) -> Result<(), BodyError> {
        let mut guard = state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Err(BodyError::Halted);
        };
        if !state.append(ai.clone()) {
            return Err(BodyError::Halted);
        }
        view.push(ai);
        for result in results {
            state.append(result.clone());
            view.push(result);
        }
        Ok(())
    }

    /// Append the final message, record the turn, and publish events.
    async fn finish_turn(
        &self,
        agent: &AgentRuntime,
        state: &SharedState,
        content: String,
    ) -> Result<String, BodyError> {
        let mut guard = state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Err(BodyError::Halted);
        };
        let cycle = state.tracker.current_cycle();
        if !state.append(Message::ai(&agent.id, content.clone()).at_cycle(cycle)) {
            return Err(BodyError::Halted);
        }
        self.events.publish(ConversationEvent::AgentMessage {
            agent_id: agent.id.clone(),
            display_name: agent.display_name.clone(),
            content: content.clone(),
            cycle,
            timestamp: Utc::now(),
        });
        if let Some(completed) = state.tracker.record_turn(&agent.id, &content) {
            self.events.publish(ConversationEvent::CycleUpdate {
                cycle: completed,
                participating: state.tracker.participating().to_vec(),
            });
        }
        Ok(content)
    }

    async fn timeout_turn(
        &self,
        agent: &AgentRuntime,
        state: &SharedState,
        cycle: u32,
    ) -> TurnOutcome {
        log::warn!("agent '{}' timed out", agent.id);
        self.events.publish(ConversationEvent::Error {
            kind: ErrorEventKind::Timeout,
            agent_id: Some(agent.id.clone()),
            message: format!("agent '{}' exceeded its turn deadline", agent.id),
        });

        let mut guard = state.lock().await;
        let Some(state) = guard.as_mut() else {
            return TurnOutcome::Cancelled;
        };
        if !state.append(Message::ai(&agent.id, TIMEOUT_MESSAGE).at_cycle(cycle)) {
            return TurnOutcome::Cancelled;
        }
        self.events.publish(ConversationEvent::AgentMessage {
            agent_id: agent.id.clone(),
            display_name: agent.display_name.clone(),
            content: TIMEOUT_MESSAGE.to_string(),
            cycle,
            timestamp: Utc::now(),
        });
        if let Some(completed) = state.tracker.record_turn(&agent.id, TIMEOUT_MESSAGE) {
            self.events.publish(ConversationEvent::CycleUpdate {
                cycle: completed,
                participating: state.tracker.participating().to_vec(),
            });
        }
        TurnOutcome::Completed {
            final_content: TIMEOUT_MESSAGE.to_string(),
        }
    }

    async fn fatal_turn(
        &self,
        agent: &AgentRuntime,
        state: &SharedState,
        error: ModelError,
    ) -> TurnOutcome {
        log::error!("agent '{}' model failure: {}", agent.id, error);
        let kind = match &error {
            ModelError::ModelNotFound(_) => ErrorEventKind::ModelNotFound,
            _ => ErrorEventKind::EndpointUnreachable,
        };
        self.events.publish(ConversationEvent::Error {
            kind,
            agent_id: Some(agent.id.clone()),
            message: error.to_string(),
        });
        {
            let mut guard = state.lock().await;
            if let Some(state) = guard.as_mut() {
                state.append(Message::ai(
                    &agent.id,
                    format!("[model unavailable: {error}]"),
                ));
            }
        }
        TurnOutcome::Fatal(error)
    }
}

fn preview(text: &str) -> String {
    const PREVIEW_LEN: usize = 120;
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
