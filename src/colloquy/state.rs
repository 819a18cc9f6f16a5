//! Conversation state owned by the orchestrator.
//!
//! All mutation goes through the driver; everything else sees snapshots.
//! Once a conversation is terminated no further messages are appended —
//! [`ConversationState::append`] enforces that invariant rather than trusting
//! callers.

use crate::colloquy::cycle::{CycleTracker, TerminationReason, TerminationRules};
use crate::colloquy::message::{Message, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The orchestrator-owned state slot. `None` until the first `start`.
/// Lock briefly; never across a model or tool await.
pub type SharedState = Arc<tokio::sync::Mutex<Option<ConversationState>>>;

/// Default trimmed-length cutoff for "quiet" utterances.
pub const DEFAULT_SILENCE_CHAR_CUTOFF: usize = 20;
/// Default deadline for a single tool call inside a turn.
pub const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on tool round-trips within one turn.
pub const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 8;

/// Where a conversation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Paused,
    Terminated,
}

/// Why and when a conversation ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Termination {
    pub reason: TerminationReason,
    pub at_cycle: u32,
}

/// Scenario settings frozen at conversation start, overrides applied.
#[derive(Debug, Clone)]
pub struct ScenarioSnapshot {
    pub name: Option<String>,
    pub goal: Option<String>,
    pub brevity: Option<String>,
    pub max_cycles: u32,
    pub starting_agent: String,
    pub participating_agents: Vec<String>,
    pub turn_timeout: Duration,
    pub keyword_triggers: Vec<String>,
    pub silence_threshold: Option<u32>,
    pub silence_char_cutoff: usize,
    pub tool_call_timeout: Duration,
    pub max_tool_iterations: u32,
}

impl ScenarioSnapshot {
    pub fn termination_rules(&self) -> TerminationRules {
        TerminationRules {
            max_cycles: self.max_cycles,
            keyword_triggers: self.keyword_triggers.clone(),
            silence_threshold: self.silence_threshold,
            silence_char_cutoff: self.silence_char_cutoff,
        }
    }
}

/// Point-in-time view returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub conversation_id: Uuid,
    pub phase: Phase,
    pub current_cycle: u32,
    pub message_count: usize,
    pub next_agent: String,
    pub termination: Option<Termination>,
    pub started_at: DateTime<Utc>,
}

/// The single mutable record of a running conversation.
pub struct ConversationState {
    pub id: Uuid,
    messages: Vec<Message>,
    pub tracker: CycleTracker,
    pub next_agent: String,
    pub phase: Phase,
    pub termination: Option<Termination>,
    pub scenario: ScenarioSnapshot,
    pub started_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(scenario: ScenarioSnapshot) -> Self {
        let tracker = CycleTracker::new(
            scenario.participating_agents.clone(),
            scenario.termination_rules(),
        );
        let next_agent = scenario.starting_agent.clone();
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            tracker,
            next_agent,
            phase: Phase::Idle,
            termination: None,
            scenario,
            started_at: Utc::now(),
        }
    }

    /// Append a message to the shared history.
    ///
    /// Returns false (and drops the message) when the conversation has
    /// terminated or the message is a thought — neither may ever land in
    /// history.
    pub fn append(&mut self, message: Message) -> bool {
        if self.phase == Phase::Terminated {
            log::warn!("dropping message appended after termination");
            return false;
        }
        if message.is_thought {
            log::warn!("dropping thought message: thoughts are transient");
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The shared history an agent sees: every non-thought, non-system
    /// message in order. (Per-agent system prompts are prepended by the turn
    /// executor, not stored in the shared history.)
    pub fn shared_view(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_thought && m.role != Role::System)
            .cloned()
            .collect()
    }

    /// Advance `next_agent` one step round-robin through the participants.
    pub fn advance_next_agent(&mut self) {
        let participants = self.tracker.participating();
        if participants.is_empty() {
            return;
        }
        let current = participants
            .iter()
            .position(|id| *id == self.next_agent)
            .unwrap_or(0);
        self.next_agent = participants[(current + 1) % participants.len()].clone();
    }

    /// Mark the conversation terminated. Idempotent: the first reason wins.
    pub fn terminate(&mut self, reason: TerminationReason) {
        if self.phase == Phase::Terminated {
            return;
        }
        self.termination = Some(Termination {
            reason,
            at_cycle: self.tracker.current_cycle(),
        });
        self.phase = Phase::Terminated;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            conversation_id: self.id,
            phase: self.phase,
            current_cycle: self.tracker.current_cycle(),
            message_count: self.messages.len(),
            next_agent: self.next_agent.clone(),
            termination: self.termination.clone(),
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ScenarioSnapshot {
        ScenarioSnapshot {
            name: None,
            goal: None,
            brevity: None,
            max_cycles: 3,
            starting_agent: "alice".into(),
            participating_agents: vec!["alice".into(), "bob".into(), "carol".into()],
            turn_timeout: Duration::from_secs(300),
            keyword_triggers: vec![],
            silence_threshold: None,
            silence_char_cutoff: DEFAULT_SILENCE_CHAR_CUTOFF,
            tool_call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    #[test]
    fn round_robin_wraps_in_declared_order() {
        let mut state = ConversationState::new(snapshot());
        assert_eq!(state.next_agent, "alice");
        state.advance_next_agent();
        assert_eq!(state.next_agent, "bob");
        state.advance_next_agent();
        assert_eq!(state.next_agent, "carol");
        state.advance_next_agent();
        assert_eq!(state.next_agent, "alice");
    }

    #[test]
    fn terminated_state_rejects_appends() {
        let mut state = ConversationState::new(snapshot());
        assert!(state.append(Message::ai("alice", "before")));
        state.terminate(TerminationReason::Stopped);
        assert!(!state.append(Message::ai("bob", "after")));
        assert_eq!(state.message_count(), 1);
        assert_eq!(
            state.termination.as_ref().unwrap().reason,
            TerminationReason::Stopped
        );
    }

    #[test]
    fn thoughts_never_enter_history() {
        let mut state = ConversationState::new(snapshot());
        let mut thought = Message::ai("alice", "internal");
        thought.is_thought = true;
        assert!(!state.append(thought));
        assert_eq!(state.message_count(), 0);
    }

    #[test]
    fn first_termination_reason_wins() {
        let mut state = ConversationState::new(snapshot());
        state.terminate(TerminationReason::MaxCycles);
        state.terminate(TerminationReason::Stopped);
        assert_eq!(
            state.termination.as_ref().unwrap().reason,
            TerminationReason::MaxCycles
        );
    }
}
