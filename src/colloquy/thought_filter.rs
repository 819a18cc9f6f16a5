//! Streaming separation of model "thinking" from the spoken response.
//!
//! Some models interleave internal reasoning with their answer, delimited by
//! tags, fenced blocks, or bracketed markers. The [`ThoughtFilter`] sits
//! between the model client and the turn executor as a [`TokenSink`]: tokens
//! inside a recognized thinking region are routed to observers as `thought`
//! events, everything else flows through as the cleaned response. Thoughts
//! never reach the shared conversation history.
//!
//! The filter is a small state machine — outside, possibly-opening,
//! inside-thought, possibly-closing — that buffers ambiguous prefixes until
//! they either complete a delimiter or fail (in which case the buffered text
//! is flushed to the response side unchanged). An unterminated thinking
//! region at end of stream stays on the thought side; it never leaks.
//!
//! The delimiter set is policy, not contract: construct a custom
//! [`ThoughtDelimiters`] to change it, or use [`ThoughtDelimiters::standard`].

use crate::colloquy::event::{ConversationEvent, EventBus};
use crate::colloquy::model::TokenSink;
use chrono::Utc;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

/// An open/close delimiter pair marking a thinking region.
#[derive(Debug, Clone)]
pub struct DelimiterPair {
    pub open: String,
    pub close: String,
}

impl DelimiterPair {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

/// The recognizable thinking markers.
///
/// `pairs` match anywhere in the stream. `leading_phrases` match only at the
/// start of a line, extend to the end of that line, and are honored only
/// when thinking mode is enabled for the agent (they are too aggressive for
/// a conservative strip).
#[derive(Debug, Clone)]
pub struct ThoughtDelimiters {
    pub pairs: Vec<DelimiterPair>,
    pub leading_phrases: Vec<String>,
}

static STANDARD_DELIMITERS: Lazy<Arc<ThoughtDelimiters>> = Lazy::new(|| {
    Arc::new(ThoughtDelimiters {
        pairs: vec![
            DelimiterPair::new("<thinking>", "</thinking>"),
            DelimiterPair::new("```thinking", "```"),
            DelimiterPair::new("[THINKING:", "]"),
        ],
        leading_phrases: vec![
            "Let me think about this...".into(),
            "Let me consider...".into(),
            "Hmm...".into(),
        ],
    })
});

impl ThoughtDelimiters {
    /// The default marker set shipped with the crate.
    pub fn standard() -> Arc<ThoughtDelimiters> {
        STANDARD_DELIMITERS.clone()
    }
}

enum RegionState {
    Outside,
    /// Inside a thinking region, watching for `close`.
    Inside { close: String },
}

struct FilterCore {
    delimiters: Arc<ThoughtDelimiters>,
    /// Leading phrases participate only when thinking mode is on.
    use_phrases: bool,
    state: RegionState,
    /// Characters withheld while they might complete a delimiter.
    hold: String,
    /// True when the next character sits at the start of a line.
    hold_line_start: bool,
    cleaned: String,
    saw_thought: bool,
}

impl FilterCore {
    fn new(delimiters: Arc<ThoughtDelimiters>, use_phrases: bool) -> Self {
        Self {
            delimiters,
            use_phrases,
            state: RegionState::Outside,
            hold: String::new(),
            hold_line_start: true,
            cleaned: String::new(),
            saw_thought: false,
        }
    }

    /// Close delimiter for an opener exactly matching `hold`, if any.
    fn exact_open(&self) -> Option<String> {
        for pair in &self.delimiters.pairs {
            if self.hold == pair.open {
                return Some(pair.close.clone());
            }
        }
        if self.use_phrases && self.hold_line_start {
            for phrase in &self.delimiters.leading_phrases {
                if self.hold == *phrase {
                    return Some("\n".to_string());
                }
            }
        }
        None
    }

    /// True when `hold` is a strict prefix of at least one opener.
    fn open_prefix_alive(&self) -> bool {
        if self.hold.is_empty() {
            return false;
        }
        let pair_hit = self
            .delimiters
            .pairs
            .iter()
            .any(|p| p.open.len() > self.hold.len() && p.open.starts_with(&self.hold));
        if pair_hit {
            return true;
        }
        self.use_phrases
            && self.hold_line_start
            && self
                .delimiters
                .leading_phrases
                .iter()
                .any(|p| p.len() > self.hold.len() && p.starts_with(&self.hold))
    }

    fn feed(&mut self, chunk: &str, clean_out: &mut String, thought_out: &mut String) {
        for ch in chunk.chars() {
            match &self.state {
                RegionState::Outside => self.feed_outside(ch, clean_out),
                RegionState::Inside { .. } => self.feed_inside(ch, thought_out),
            }
        }
    }

    fn feed_outside(&mut self, ch: char, clean_out: &mut String) {
        self.hold.push(ch);
        loop {
            if let Some(close) = self.exact_open() {
                self.hold.clear();
                // Anything after an opener is mid-line until proven otherwise.
                self.hold_line_start = false;
                self.state = RegionState::Inside { close };
                self.saw_thought = true;
                return;
            }
            if self.open_prefix_alive() {
                return;
            }
            match take_first(&mut self.hold) {
                Some(flushed) => {
                    clean_out.push(flushed);
                    self.cleaned.push(flushed);
                    self.hold_line_start = flushed == '\n';
                }
                None => return,
            }
        }
    }

    fn feed_inside(&mut self, ch: char, thought_out: &mut String) {
        let close = match &self.state {
            RegionState::Inside { close } => close.clone(),
            RegionState::Outside => unreachable!(),
        };
        self.hold.push(ch);
        loop {
            if self.hold == close {
                self.hold.clear();
                self.hold_line_start = close.ends_with('\n');
                self.state = RegionState::Outside;
                return;
            }
            if close.len() > self.hold.len() && close.starts_with(&self.hold) {
                return;
            }
            match take_first(&mut self.hold) {
                Some(flushed) => thought_out.push(flushed),
                None => return,
            }
        }
    }

    /// Flush whatever is still withheld. A pending opener candidate was not
    /// a delimiter after all; a pending region stays thought.
    fn finish(&mut self, clean_out: &mut String, thought_out: &mut String) {
        let remainder = std::mem::take(&mut self.hold);
        match self.state {
            RegionState::Outside => {
                clean_out.push_str(&remainder);
                self.cleaned.push_str(&remainder);
            }
            RegionState::Inside { .. } => thought_out.push_str(&remainder),
        }
    }
}

fn take_first(buf: &mut String) -> Option<char> {
    let ch = buf.chars().next()?;
    buf.drain(..ch.len_utf8());
    Some(ch)
}

/// Token-stream filter separating thoughts from the spoken response.
///
/// Implements [`TokenSink`] so it can be handed directly to a
/// [`ModelClient`](crate::model::ModelClient). Cleaned tokens are forwarded
/// to the optional downstream sink as they resolve; thought tokens are
/// published as [`ConversationEvent::Thought`] for the owning agent when
/// thinking mode is enabled (and silently stripped when it is not).
pub struct ThoughtFilter {
    core: Mutex<FilterCore>,
    thinking_enabled: bool,
    agent_id: String,
    events: Option<Arc<EventBus>>,
    downstream: Option<Arc<dyn TokenSink>>,
}

impl ThoughtFilter {
    pub fn new(delimiters: Arc<ThoughtDelimiters>, thinking_enabled: bool) -> Self {
        Self {
            core: Mutex::new(FilterCore::new(delimiters, thinking_enabled)),
            thinking_enabled,
            agent_id: String::new(),
            events: None,
            downstream: None,
        }
    }

    /// Publish thought chunks for `agent_id` on `events`.
    pub fn with_events(mut self, events: Arc<EventBus>, agent_id: impl Into<String>) -> Self {
        self.events = Some(events);
        self.agent_id = agent_id.into();
        self
    }

    /// Forward cleaned tokens to `sink` as they resolve.
    pub fn with_downstream(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.downstream = Some(sink);
        self
    }

    fn dispatch(&self, clean_out: String, thought_out: String) {
        if !clean_out.is_empty() {
            if let Some(downstream) = &self.downstream {
                downstream.on_token(&clean_out);
            }
        }
        if !thought_out.is_empty() && self.thinking_enabled {
            if let Some(events) = &self.events {
                events.publish(ConversationEvent::Thought {
                    agent_id: self.agent_id.clone(),
                    chunk: thought_out,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Flush pending buffers and return the cleaned response accumulated so
    /// far. Call once the model stream has completed.
    pub fn finish(&self) -> String {
        let mut clean_out = String::new();
        let mut thought_out = String::new();
        let cleaned = {
            let mut core = self.core.lock().expect("thought filter poisoned");
            core.finish(&mut clean_out, &mut thought_out);
            core.cleaned.clone()
        };
        self.dispatch(clean_out, thought_out);
        cleaned
    }

    /// True once the stream has entered at least one thinking region.
    pub fn saw_thought(&self) -> bool {
        let core = self.core.lock().expect("thought filter poisoned");
        core.saw_thought
    }

    /// Run the same machine over completed text, returning it with
    /// recognized thought regions removed. Leading-phrase heuristics are not
    /// applied — this is the conservative strip used when thinking mode is
    /// off or a response arrived unstreamed.
    pub fn scrub(text: &str, delimiters: &Arc<ThoughtDelimiters>) -> String {
        let mut core = FilterCore::new(delimiters.clone(), false);
        let mut clean = String::new();
        let mut thought = String::new();
        core.feed(text, &mut clean, &mut thought);
        core.finish(&mut clean, &mut thought);
        clean
    }
}

impl TokenSink for ThoughtFilter {
    fn on_token(&self, chunk: &str) {
        let mut clean_out = String::new();
        let mut thought_out = String::new();
        {
            let mut core = self.core.lock().expect("thought filter poisoned");
            core.feed(chunk, &mut clean_out, &mut thought_out);
        }
        self.dispatch(clean_out, thought_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str], thinking: bool) -> String {
        let filter = ThoughtFilter::new(ThoughtDelimiters::standard(), thinking);
        for chunk in chunks {
            filter.on_token(chunk);
        }
        filter.finish()
    }

    #[test]
    fn passthrough_without_delimiters() {
        assert_eq!(run(&["hello ", "world"], true), "hello world");
    }

    #[test]
    fn strips_tagged_region() {
        assert_eq!(run(&["<thinking>plan</thinking>answer"], true), "answer");
    }

    #[test]
    fn delimiter_split_across_chunks() {
        assert_eq!(
            run(&["<thin", "king>secret</thi", "nking>ok"], true),
            "ok"
        );
    }

    #[test]
    fn failed_prefix_is_flushed() {
        assert_eq!(run(&["<thinker> is fine"], true), "<thinker> is fine");
    }

    #[test]
    fn unterminated_region_never_leaks() {
        assert_eq!(run(&["before<thinking>never closed"], true), "before");
    }

    #[test]
    fn fenced_block_is_thought_but_code_is_not() {
        assert_eq!(run(&["```thinking\nhmm\n```after"], true), "after");
        assert_eq!(run(&["```rust\nfn x() {}\n```"], true), "```rust\nfn x() {}\n```");
    }

    #[test]
    fn bracketed_marker() {
        assert_eq!(run(&["[THINKING: scheming]done"], true), "done");
    }

    #[test]
    fn leading_phrase_consumes_line_in_thinking_mode() {
        assert_eq!(run(&["Hmm... tricky one\nanswer"], true), "answer");
        // Mid-line phrases are left alone.
        assert_eq!(run(&["Well, Hmm... no\nx"], true), "Well, Hmm... no\nx");
    }

    #[test]
    fn thinking_disabled_still_strips_tagged_regions() {
        assert_eq!(run(&["<thinking>x</thinking>y"], false), "y");
        // But leading phrases survive the conservative strip.
        assert_eq!(run(&["Hmm... maybe\ny"], false), "Hmm... maybe\ny");
    }

    #[test]
    fn downstream_receives_only_cleaned_tokens() {
        struct Capture(Mutex<String>);
        impl TokenSink for Capture {
            fn on_token(&self, chunk: &str) {
                self.0.lock().unwrap().push_str(chunk);
            }
        }

        let capture = Arc::new(Capture(Mutex::new(String::new())));
        let filter = ThoughtFilter::new(ThoughtDelimiters::standard(), true)
            .with_downstream(capture.clone());
        filter.on_token("<thinking>x</thinking>ok");
        filter.finish();
        assert_eq!(capture.0.lock().unwrap().as_str(), "ok");
    }

    #[test]
    fn scrub_completed_text() {
        let cleaned = ThoughtFilter::scrub(
            "a<thinking>b</thinking>c[THINKING: d]e",
            &ThoughtDelimiters::standard(),
        );
        assert_eq!(cleaned, "ace");
    }
}
