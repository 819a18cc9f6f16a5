//! Conversation event fabric.
//!
//! Everything observable about a running conversation — streamed thoughts,
//! finished utterances, turn hand-offs, tool traffic, lifecycle edges, and
//! errors — is published as a [`ConversationEvent`] through an [`EventBus`].
//!
//! The bus is deliberately lossy and off the critical path:
//!
//! - `publish` is synchronous and never blocks the conversation driver.
//! - Each subscriber owns a bounded queue drained by its own delivery task;
//!   a slow or failing observer affects nobody else.
//! - On overflow the **oldest** queued event is discarded and a per-subscriber
//!   drop counter is incremented.
//!
//! Per-subscriber ordering is preserved; there is no ordering guarantee
//! across subscribers.
//!
//! # Example
//!
//! ```rust,no_run
//! use colloquy::event::{ConversationEvent, EventBus, EventObserver};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventObserver for Printer {
//!     async fn on_event(&self, event: &ConversationEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//!
//! let bus = EventBus::new();
//! bus.subscribe("console", Arc::new(Printer));
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default per-subscriber queue depth before drop-oldest kicks in.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Lifecycle edges of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Started,
    Paused,
    Resumed,
    Stopped,
    Ended,
}

/// Discriminates `error` events so observers can react without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorEventKind {
    /// An agent turn exceeded its deadline.
    Timeout,
    /// A model endpoint could not be reached.
    EndpointUnreachable,
    /// The configured model does not exist on the endpoint.
    ModelNotFound,
    /// A response could not be interpreted; recovery was best-effort.
    Protocol,
    /// A tool server failed to start or answer.
    Tool,
}

/// A self-describing record published to observers.
///
/// Serializes with a `type` discriminator so transports can forward events
/// verbatim (e.g. as web-socket JSON frames).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// A chunk of internal reasoning streamed by an agent's model.
    ///
    /// Thoughts never enter the shared history; this event is their only
    /// exit path.
    Thought {
        agent_id: String,
        chunk: String,
        timestamp: DateTime<Utc>,
    },
    /// An agent finished its turn with this utterance.
    AgentMessage {
        agent_id: String,
        display_name: String,
        content: String,
        cycle: u32,
        timestamp: DateTime<Utc>,
    },
    /// The named agent is about to take its turn.
    TurnIndicator { agent_id: String },
    /// An agent requested a tool invocation.
    ToolCall {
        agent_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// A tool invocation finished (successfully or not).
    ToolResult {
        tool_name: String,
        /// First ~120 characters of the rendered result or error text.
        result_preview: String,
        duration_ms: u64,
    },
    /// A full cycle completed.
    CycleUpdate {
        cycle: u32,
        participating: Vec<String>,
    },
    /// The conversation (or a tool server) crossed a lifecycle edge.
    Lifecycle { kind: LifecycleKind, detail: String },
    /// Something went wrong. Fatal errors are always accompanied by a
    /// `Lifecycle { kind: Ended, .. }` event.
    Error {
        kind: ErrorEventKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        message: String,
    },
}

/// Receives events for a single subscriber.
///
/// Implementations run on the subscriber's own delivery task, so they may
/// await freely (e.g. a web-socket send) without stalling the conversation.
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &ConversationEvent);
}

struct Subscriber {
    queue: Mutex<VecDeque<ConversationEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl Subscriber {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    /// Enqueue an event, discarding the oldest entry on overflow.
    fn push(&self, event: ConversationEvent) {
        {
            let mut queue = self.queue.lock().expect("subscriber queue poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<ConversationEvent> {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        queue.drain(..).collect()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Fan-out hub for [`ConversationEvent`]s keyed by client id.
///
/// Cheap to share: wrap in `Arc` and hand clones to the orchestrator, turn
/// executor, and tool registry.
pub struct EventBus {
    subscribers: DashMap<String, Arc<Subscriber>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with a custom per-subscriber queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register an observer under `client_id`, spawning its delivery task.
    ///
    /// Re-subscribing under an existing id replaces the previous observer.
    pub fn subscribe(&self, client_id: impl Into<String>, observer: Arc<dyn EventObserver>) {
        let client_id = client_id.into();
        let subscriber = Arc::new(Subscriber::new(self.capacity));
        if let Some(previous) = self.subscribers.insert(client_id.clone(), subscriber.clone()) {
            previous.close();
        }

        tokio::spawn(async move {
            loop {
                let batch = subscriber.drain();
                if batch.is_empty() {
                    if subscriber.closed.load(Ordering::Acquire) {
                        break;
                    }
                    subscriber.notify.notified().await;
                    continue;
                }
                for event in &batch {
                    observer.on_event(event).await;
                }
            }
        });
        log::debug!("event bus: subscribed client '{}'", client_id);
    }

    /// Remove a subscriber and stop its delivery task.
    pub fn unsubscribe(&self, client_id: &str) {
        if let Some((_, subscriber)) = self.subscribers.remove(client_id) {
            subscriber.close();
            log::debug!("event bus: unsubscribed client '{}'", client_id);
        }
    }

    /// Deliver `event` to every live subscriber. Never blocks.
    pub fn publish(&self, event: ConversationEvent) {
        for entry in self.subscribers.iter() {
            entry.value().push(event.clone());
        }
    }

    /// Events discarded so far for `client_id` due to queue overflow.
    pub fn dropped(&self, client_id: &str) -> Option<u64> {
        self.subscribers
            .get(client_id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let subscriber = Subscriber::new(2);
        for i in 0..4 {
            subscriber.push(ConversationEvent::TurnIndicator {
                agent_id: format!("a{i}"),
            });
        }
        assert_eq!(subscriber.dropped.load(Ordering::Relaxed), 2);
        let batch = subscriber.drain();
        assert_eq!(batch.len(), 2);
        match &batch[0] {
            ConversationEvent::TurnIndicator { agent_id } => assert_eq!(agent_id, "a2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ConversationEvent::Lifecycle {
            kind: LifecycleKind::Started,
            detail: "conversation abc".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lifecycle");
        assert_eq!(json["kind"], "started");
    }
}
