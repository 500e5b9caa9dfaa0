//! ManagerContext: the orchestrator-owned record of the run.
//!
//! Mutated only by the orchestrator at phase boundaries; everyone else sees
//! snapshots. Injected instructions accumulate between iterations and are
//! drained exactly once, at the top of the next one.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Clone, Debug, serde::Serialize)]
pub struct ClarificationExchange {
    pub question: String,
    pub answer: String,
    pub ts: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ManagerContext {
    pub original_prompt: String,
    /// Derived: original prompt plus every instruction applied so far.
    pub effective_prompt: String,
    injected_instructions: Vec<String>,
    applied_instructions: Vec<String>,
    pub approved_plan: Option<String>,
    pub completed_iterations: u64,
    pub last_iteration_start: Option<DateTime<Utc>>,
    pub next_iteration_due: Option<DateTime<Utc>>,
    pub clarification_history: Vec<ClarificationExchange>,
    pub learnings: Vec<String>,
    pub previous_iteration_summary: Option<String>,
    seen_event_ids: BTreeSet<String>,
}

impl ManagerContext {
    pub fn new(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            effective_prompt: prompt.clone(),
            original_prompt: prompt,
            ..Default::default()
        }
    }

    /// Queue an instruction for the next iteration boundary. Dedup is on by
    /// default: re-queuing a pending duplicate is a no-op.
    pub fn inject(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if self.injected_instructions.contains(&text) {
            return false;
        }
        self.injected_instructions.push(text);
        true
    }

    pub fn injected_instructions(&self) -> &[String] {
        &self.injected_instructions
    }

    /// Atomically move pending instructions into the effective prompt and
    /// the learnings, clearing the pending set. Runs at the top of every
    /// iteration, so each instruction is applied exactly once.
    pub fn drain_injected(&mut self) -> Vec<String> {
        let drained = std::mem::take(&mut self.injected_instructions);
        if drained.is_empty() {
            return drained;
        }
        for text in &drained {
            if !self.learnings.contains(text) {
                self.learnings.push(text.clone());
            }
            self.applied_instructions.push(text.clone());
        }
        self.rebuild_effective_prompt();
        drained
    }

    fn rebuild_effective_prompt(&mut self) {
        let mut prompt = self.original_prompt.clone();
        if !self.applied_instructions.is_empty() {
            prompt.push_str("\n\nAdditional standing instructions:\n");
            for instruction in &self.applied_instructions {
                prompt.push_str(&format!("- {}\n", instruction));
            }
        }
        self.effective_prompt = prompt.trim_end().to_string();
    }

    pub fn add_learnings(&mut self, learnings: &[String]) {
        for learning in learnings {
            if !self.learnings.contains(learning) {
                self.learnings.push(learning.clone());
            }
        }
    }

    pub fn record_clarification(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.clarification_history.push(ClarificationExchange {
            question: question.into(),
            answer: answer.into(),
            ts: Utc::now(),
        });
    }

    /// Record a discovered event id; false when it was already seen (the
    /// scheduler logs a SkippedDuplicate for those).
    pub fn mark_event_seen(&mut self, event_id: &str) -> bool {
        if event_id.is_empty() {
            return true;
        }
        self.seen_event_ids.insert(event_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_dedups_pending_instructions() {
        let mut context = ManagerContext::new("objective");
        assert!(context.inject("watch the repos"));
        assert!(!context.inject("watch the repos"));
        assert_eq!(context.injected_instructions().len(), 1);
    }

    #[test]
    fn drain_applies_exactly_once() {
        let mut context = ManagerContext::new("objective");
        context.inject("watch the repos");
        context.inject("ignore weekends");

        let drained = context.drain_injected();
        assert_eq!(drained.len(), 2);
        assert!(context.injected_instructions().is_empty());
        assert!(context.effective_prompt.starts_with("objective"));
        assert!(context.effective_prompt.contains("- watch the repos"));
        assert!(context.effective_prompt.contains("- ignore weekends"));
        assert_eq!(context.learnings.len(), 2);

        // A second drain with nothing pending changes nothing.
        let effective_before = context.effective_prompt.clone();
        assert!(context.drain_injected().is_empty());
        assert_eq!(context.effective_prompt, effective_before);
        assert_eq!(context.learnings.len(), 2);
    }

    #[test]
    fn instructions_accumulate_across_drains() {
        let mut context = ManagerContext::new("objective");
        context.inject("first");
        context.drain_injected();
        context.inject("second");
        context.drain_injected();
        assert!(context.effective_prompt.contains("- first"));
        assert!(context.effective_prompt.contains("- second"));
    }

    #[test]
    fn learnings_dedup() {
        let mut context = ManagerContext::new("objective");
        context.add_learnings(&["a".into(), "b".into()]);
        context.add_learnings(&["b".into(), "c".into()]);
        assert_eq!(context.learnings, vec!["a", "b", "c"]);
    }

    #[test]
    fn event_ids_are_seen_once() {
        let mut context = ManagerContext::new("objective");
        assert!(context.mark_event_seen("E1"));
        assert!(!context.mark_event_seen("E1"));
        assert!(context.mark_event_seen("E2"));
        // Events without ids are never treated as duplicates.
        assert!(context.mark_event_seen(""));
        assert!(context.mark_event_seen(""));
    }
}
