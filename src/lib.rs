//! # colloquy
//!
//! colloquy orchestrates turn-based conversations between two or more
//! autonomous language-model agents. A host hands it a validated
//! configuration describing agents (persona, model endpoint, tool servers),
//! scenarios (participants, termination rules), and initialization (system
//! prompt template, opening message); the orchestrator drives agents through
//! strict round-robin turns, invokes model endpoints, dispatches tool calls
//! to external stdio subprocess servers, enforces termination, and streams
//! every internal thought and external utterance to observers in real time.
//!
//! The crate provides carefully layered abstractions for:
//!
//! * **Conversation driving**: [`Orchestrator`] owns the state machine
//!   (idle → running ⇄ paused → terminated), the round-robin scheduler, and
//!   the command surface (`start`, `run_cycles`, `pause`, `resume`, `stop`,
//!   `status`)
//! * **Thought separation**: [`thought_filter::ThoughtFilter`] splits model
//!   token streams into observer-visible thoughts and the cleaned response
//!   that actually enters history
//! * **Tool routing**: [`tool_registry::ToolRegistry`] starts, monitors, and
//!   stops tool-server subprocesses, scopes them globally or per agent, and
//!   routes calls over newline-framed JSON-RPC stdio
//! * **Cycle accounting**: [`cycle::CycleTracker`] detects cycle completion
//!   and evaluates termination (max cycles, keyword triggers, silence)
//! * **Observer fan-out**: [`event::EventBus`] broadcasts typed events to
//!   subscribers with bounded, lossy, per-subscriber queues
//! * **Provider access**: the [`model::ModelClient`] trait with a streaming
//!   [`clients::ollama::OllamaClient`] implementation for Ollama-compatible
//!   endpoints
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use colloquy::{init::Overrides, Orchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     colloquy::init_logger();
//!
//!     // Deserialize a validated configuration however you like — the core
//!     // never parses files itself.
//!     let config: colloquy::config::RootConfig =
//!         serde_json::from_str(&std::fs::read_to_string("conversation.json")?)?;
//!
//!     let orchestrator = Arc::new(Orchestrator::new(config));
//!     orchestrator.start_global_tool_servers().await;
//!
//!     let receipt = orchestrator.start(None, Overrides::default()).await?;
//!     println!(
//!         "conversation {} with {:?}",
//!         receipt.conversation_id, receipt.participating_agents
//!     );
//!
//!     let outcome = orchestrator.run().await?;
//!     println!(
//!         "finished after {} cycles ({:?})",
//!         outcome.current_cycle, outcome.termination_reason
//!     );
//!     Ok(())
//! }
//! ```
//!
//! Observers subscribe to the event bus for real-time streaming — thought
//! chunks, finished utterances, turn hand-offs, tool traffic, lifecycle
//! edges, and errors — each behind its own bounded queue so a slow consumer
//! never stalls the conversation.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Hosts embedding colloquy can opt in to `RUST_LOG`-driven diagnostics
/// without committing to a logging backend of their own.
///
/// ```rust
/// colloquy::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `colloquy` module.
pub mod colloquy;

// Re-exporting key items for easier external access.
pub use colloquy::agent::AgentRuntime;
pub use colloquy::clients;
pub use colloquy::config;
pub use colloquy::cycle;
pub use colloquy::cycle::TerminationReason;
pub use colloquy::event;
pub use colloquy::event::{ConversationEvent, EventBus, EventObserver};
pub use colloquy::init;
pub use colloquy::init::Overrides;
pub use colloquy::message;
pub use colloquy::message::{Message, Role, ToolCall};
pub use colloquy::model;
pub use colloquy::model::{ModelClient, ModelClientFactory, ModelError, ModelResponse, TokenSink};
pub use colloquy::orchestrator;
pub use colloquy::orchestrator::Orchestrator;
pub use colloquy::prompt;
pub use colloquy::state::{Phase, StatusSnapshot};
pub use colloquy::thought_filter;
pub use colloquy::thought_filter::{ThoughtDelimiters, ThoughtFilter};
pub use colloquy::tool_proxy;
pub use colloquy::tool_registry;
pub use colloquy::tool_registry::{ServerSpec, ToolRegistry};
