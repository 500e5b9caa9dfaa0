//! The knowledge brief: compressed memory retained across iterations.
//!
//! After aggregation the manager produces an executive summary; the store
//! keeps it plus the last three iteration summaries, deduped learnings and
//! open questions. The rendered brief is the sole context for follow-up
//! Q&A once the office has stopped.

use opscenter_agents::parse;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const ROLLING_SUMMARIES: usize = 3;

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct KnowledgeBrief {
    pub executive_summary: String,
    /// Last three iteration summaries, oldest first.
    pub recent_summaries: VecDeque<String>,
    pub learnings: Vec<String>,
    pub open_questions: Vec<String>,
}

impl KnowledgeBrief {
    pub fn is_empty(&self) -> bool {
        self.executive_summary.is_empty()
            && self.recent_summaries.is_empty()
            && self.learnings.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Knowledge Brief\n");
        if !self.executive_summary.is_empty() {
            out.push_str(&format!("\n## Executive Summary\n{}\n", self.executive_summary));
        }
        if !self.recent_summaries.is_empty() {
            out.push_str("\n## Recent Iterations\n");
            for (n, summary) in self.recent_summaries.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", n + 1, summary));
            }
        }
        if !self.learnings.is_empty() {
            out.push_str("\n## Learnings\n");
            for learning in &self.learnings {
                out.push_str(&format!("- {}\n", learning));
            }
        }
        if !self.open_questions.is_empty() {
            out.push_str("\n## Open Questions\n");
            for question in &self.open_questions {
                out.push_str(&format!("- {}\n", question));
            }
        }
        out
    }
}

#[derive(Default)]
pub struct BriefStore {
    inner: Mutex<KnowledgeBrief>,
}

impl BriefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Roll in one iteration's summary and learnings.
    pub fn absorb_iteration(&self, summary: impl Into<String>, learnings: &[String]) {
        let mut brief = self.inner.lock().unwrap();
        brief.recent_summaries.push_back(summary.into());
        while brief.recent_summaries.len() > ROLLING_SUMMARIES {
            brief.recent_summaries.pop_front();
        }
        for learning in learnings {
            if !brief.learnings.contains(learning) {
                brief.learnings.push(learning.clone());
            }
        }
    }

    /// Install the manager's compressed brief. Open questions are lifted
    /// from its `## Open Questions` section; the rest is the summary.
    pub fn set_executive(&self, text: &str) {
        let mut brief = self.inner.lock().unwrap();
        brief.open_questions = parse::extract_section(text, "open questions")
            .map(|section| parse::bullet_lines(&section))
            .unwrap_or_default();
        let mut summary = String::new();
        let mut in_open_questions = false;
        for line in text.lines() {
            let trimmed = line.trim_start();
            if trimmed.strip_prefix('#').is_some() {
                let title = trimmed.trim_start_matches('#').trim().to_ascii_lowercase();
                in_open_questions = title == "open questions";
                if in_open_questions {
                    continue;
                }
            }
            if !in_open_questions {
                summary.push_str(line);
                summary.push('\n');
            }
        }
        brief.executive_summary = summary.trim().to_string();
    }

    pub fn snapshot(&self) -> KnowledgeBrief {
        self.inner.lock().unwrap().clone()
    }

    pub fn render(&self) -> String {
        self.inner.lock().unwrap().render()
    }

    pub fn executive_summary(&self) -> String {
        self.inner.lock().unwrap().executive_summary.clone()
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap() = KnowledgeBrief::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_roll_at_three() {
        let store = BriefStore::new();
        for n in 1..=5 {
            store.absorb_iteration(format!("iteration {}", n), &[]);
        }
        let brief = store.snapshot();
        assert_eq!(brief.recent_summaries.len(), 3);
        assert_eq!(brief.recent_summaries[0], "iteration 3");
        assert_eq!(brief.recent_summaries[2], "iteration 5");
    }

    #[test]
    fn learnings_dedup() {
        let store = BriefStore::new();
        store.absorb_iteration("one", &["a".into(), "b".into()]);
        store.absorb_iteration("two", &["b".into(), "c".into()]);
        assert_eq!(store.snapshot().learnings, vec!["a", "b", "c"]);
    }

    #[test]
    fn executive_splits_out_open_questions() {
        let store = BriefStore::new();
        store.set_executive(
            "The office triaged three incidents.\n\n## Open Questions\n- why does the queue spike?\n- is the pager flaky?",
        );
        let brief = store.snapshot();
        assert_eq!(brief.executive_summary, "The office triaged three incidents.");
        assert_eq!(
            brief.open_questions,
            vec!["why does the queue spike?", "is the pager flaky?"]
        );
    }

    #[test]
    fn render_contains_all_sections() {
        let store = BriefStore::new();
        store.absorb_iteration("triaged three incidents", &["queue spikes at 09:00".into()]);
        store.set_executive("All quiet overall.\n\n## Open Questions\n- anything else?");
        let rendered = store.render();
        assert!(rendered.contains("# Knowledge Brief"));
        assert!(rendered.contains("All quiet overall."));
        assert!(rendered.contains("triaged three incidents"));
        assert!(rendered.contains("queue spikes at 09:00"));
        assert!(rendered.contains("anything else?"));
    }

    #[test]
    fn clear_empties_everything() {
        let store = BriefStore::new();
        store.absorb_iteration("x", &["y".into()]);
        store.clear();
        assert!(store.snapshot().is_empty());
    }
}
