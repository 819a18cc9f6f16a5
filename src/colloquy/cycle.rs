//! Cycle accounting and termination predicates.
//!
//! A cycle completes exactly when every participating agent has spoken once.
//! The tracker keeps a signature per completed cycle — the trimmed lengths of
//! each final utterance — which is what silence detection is defined over.
//!
//! Termination is evaluated after every turn (not only at cycle boundaries)
//! so keyword triggers stop the conversation promptly. Predicates are
//! checked in a fixed order and the first match wins.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Why a conversation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxCycles,
    Keyword(String),
    Silence,
    Stopped,
    AgentError,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::MaxCycles => write!(f, "max_cycles"),
            TerminationReason::Keyword(word) => write!(f, "keyword:{word}"),
            TerminationReason::Silence => write!(f, "silence"),
            TerminationReason::Stopped => write!(f, "stopped"),
            TerminationReason::AgentError => write!(f, "agent_error"),
        }
    }
}

/// Termination rules the tracker evaluates.
#[derive(Debug, Clone, Default)]
pub struct TerminationRules {
    pub max_cycles: u32,
    /// Case-insensitive substrings that end the conversation on sight.
    pub keyword_triggers: Vec<String>,
    /// Number of consecutive all-quiet cycles that ends the conversation.
    pub silence_threshold: Option<u32>,
    /// Trimmed length at or below which an utterance counts as quiet.
    pub silence_char_cutoff: usize,
}

/// Tracks which agents have spoken this cycle and decides termination.
pub struct CycleTracker {
    participating: Vec<String>,
    spoken: HashSet<String>,
    current_cycle: u32,
    /// Per completed cycle: trimmed final-content length of each turn.
    signatures: Vec<Vec<usize>>,
    pending: Vec<usize>,
    rules: TerminationRules,
}

impl CycleTracker {
    pub fn new(participating: Vec<String>, rules: TerminationRules) -> Self {
        Self {
            participating,
            spoken: HashSet::new(),
            current_cycle: 0,
            signatures: Vec::new(),
            pending: Vec::new(),
            rules,
        }
    }

    pub fn current_cycle(&self) -> u32 {
        self.current_cycle
    }

    pub fn participating(&self) -> &[String] {
        &self.participating
    }

    /// Agents that have spoken in the cycle under way.
    pub fn spoken_this_cycle(&self) -> &HashSet<String> {
        &self.spoken
    }

    /// Record a completed turn. Returns the cycle number when this turn
    /// closed out a full cycle.
    pub fn record_turn(&mut self, agent_id: &str, final_content: &str) -> Option<u32> {
        if !self.participating.iter().any(|a| a == agent_id) {
            log::warn!("turn recorded for non-participating agent '{}'", agent_id);
            return None;
        }
        self.spoken.insert(agent_id.to_string());
        self.pending.push(final_content.trim().len());

        if self.spoken.len() == self.participating.len() {
            Some(self.complete_cycle())
        } else {
            None
        }
    }

    fn complete_cycle(&mut self) -> u32 {
        self.current_cycle += 1;
        self.signatures.push(std::mem::take(&mut self.pending));
        self.spoken.clear();
        log::info!("cycle {} complete", self.current_cycle);
        self.current_cycle
    }

    /// Evaluate the termination predicates against the latest utterance.
    /// First match wins: max cycles, then keywords, then silence.
    pub fn check_termination(&self, latest_content: &str) -> Option<TerminationReason> {
        if self.current_cycle >= self.rules.max_cycles {
            return Some(TerminationReason::MaxCycles);
        }

        let lowered = latest_content.to_lowercase();
        for keyword in &self.rules.keyword_triggers {
            if lowered.contains(&keyword.to_lowercase()) {
                return Some(TerminationReason::Keyword(keyword.clone()));
            }
        }

        if let Some(threshold) = self.rules.silence_threshold {
            let threshold = threshold as usize;
            if threshold > 0 && self.signatures.len() >= threshold {
                let quiet = self.signatures[self.signatures.len() - threshold..]
                    .iter()
                    .all(|cycle| {
                        cycle
                            .iter()
                            .all(|&len| len <= self.rules.silence_char_cutoff)
                    });
                if quiet {
                    return Some(TerminationReason::Silence);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(max_cycles: u32) -> TerminationRules {
        TerminationRules {
            max_cycles,
            keyword_triggers: Vec::new(),
            silence_threshold: None,
            silence_char_cutoff: 20,
        }
    }

    fn two_agents() -> Vec<String> {
        vec!["alice".to_string(), "bob".to_string()]
    }

    #[test]
    fn cycle_completes_when_all_have_spoken() {
        let mut tracker = CycleTracker::new(two_agents(), rules(5));
        assert_eq!(tracker.record_turn("alice", "hello"), None);
        assert_eq!(tracker.record_turn("bob", "hi"), Some(1));
        assert_eq!(tracker.current_cycle(), 1);
        assert!(tracker.spoken_this_cycle().is_empty());
    }

    #[test]
    fn unknown_agent_is_ignored() {
        let mut tracker = CycleTracker::new(two_agents(), rules(5));
        assert_eq!(tracker.record_turn("mallory", "hi"), None);
        assert_eq!(tracker.current_cycle(), 0);
    }

    #[test]
    fn max_cycles_fires_at_boundary() {
        let mut tracker = CycleTracker::new(two_agents(), rules(2));
        tracker.record_turn("alice", "one");
        tracker.record_turn("bob", "two");
        assert_eq!(tracker.check_termination("two"), None);
        tracker.record_turn("alice", "three");
        tracker.record_turn("bob", "four");
        assert_eq!(
            tracker.check_termination("four"),
            Some(TerminationReason::MaxCycles)
        );
    }

    #[test]
    fn keyword_beats_max_cycles_before_boundary() {
        let mut rules = rules(10);
        rules.keyword_triggers.push("goodbye".into());
        let mut tracker = CycleTracker::new(two_agents(), rules);
        tracker.record_turn("alice", "hi");
        assert_eq!(
            tracker.check_termination("ok, GOODBYE now"),
            Some(TerminationReason::Keyword("goodbye".into()))
        );
    }

    #[test]
    fn keyword_match_is_case_insensitive_substring() {
        let mut rules = rules(10);
        rules.keyword_triggers.push("The End".into());
        let tracker = CycleTracker::new(two_agents(), rules);
        assert_eq!(
            tracker.check_termination("...and that is the end of it"),
            Some(TerminationReason::Keyword("The End".into()))
        );
    }

    #[test]
    fn silence_requires_full_quiet_cycles() {
        let mut rules = rules(10);
        rules.silence_threshold = Some(2);
        let mut tracker = CycleTracker::new(two_agents(), rules);

        tracker.record_turn("alice", ".");
        tracker.record_turn("bob", ".");
        assert_eq!(tracker.check_termination("."), None);

        tracker.record_turn("alice", ".");
        tracker.record_turn("bob", ".");
        assert_eq!(
            tracker.check_termination("."),
            Some(TerminationReason::Silence)
        );
    }

    #[test]
    fn substantive_cycle_resets_silence_window() {
        let mut rules = rules(10);
        rules.silence_threshold = Some(2);
        let mut tracker = CycleTracker::new(two_agents(), rules);

        tracker.record_turn("alice", ".");
        tracker.record_turn("bob", ".");
        tracker.record_turn("alice", "actually, here is a much longer reply");
        tracker.record_turn("bob", ".");
        assert_eq!(tracker.check_termination("."), None);
    }

    #[test]
    fn reason_display_forms() {
        assert_eq!(TerminationReason::MaxCycles.to_string(), "max_cycles");
        assert_eq!(
            TerminationReason::Keyword("goodbye".into()).to_string(),
            "keyword:goodbye"
        );
        assert_eq!(TerminationReason::Silence.to_string(), "silence");
        assert_eq!(TerminationReason::Stopped.to_string(), "stopped");
        assert_eq!(TerminationReason::AgentError.to_string(), "agent_error");
    }
}
