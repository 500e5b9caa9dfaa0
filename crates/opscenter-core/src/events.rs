//! The typed event stream vocabulary.
//!
//! Every observable decision the office makes is one of these variants.
//! Producers send them through a single channel; the pump appends to the
//! event log and fans out to broadcast subscribers.

use crate::phase::ManagerPhase;
use crate::task::IterationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OfficeEvent {
    PhaseChanged {
        from: ManagerPhase,
        to: ManagerPhase,
    },
    IterationStarted {
        iteration: u64,
    },
    IterationCompleted {
        report: Box<IterationReport>,
    },
    EventsFetched {
        iteration: u64,
        count: usize,
    },
    NoEventsFound {
        iteration: u64,
    },
    TaskCreated {
        task_id: String,
        title: String,
        priority: u8,
    },
    TaskAssigned {
        task_id: String,
        assistant_index: usize,
    },
    TaskQueued {
        task_id: String,
        position: usize,
    },
    TaskDequeued {
        task_id: String,
        assistant_index: usize,
    },
    TaskCancelled {
        task_id: String,
        reason: String,
    },
    AssistantSpawned {
        assistant_index: usize,
        task_id: String,
    },
    AssistantProgress {
        assistant_index: usize,
        task_id: String,
        chars: usize,
    },
    AssistantCompleted {
        assistant_index: usize,
        task_id: String,
    },
    AssistantFailed {
        assistant_index: usize,
        task_id: String,
        error: String,
    },
    AssistantDisposed {
        assistant_index: usize,
        task_id: String,
    },
    AggregationStarted {
        iteration: u64,
    },
    ReportGenerated {
        iteration: u64,
    },
    RestStarted {
        duration_secs: u64,
    },
    RestCountdownTick {
        remaining_secs: u64,
        due_ts: DateTime<Utc>,
    },
    RestCompleted {
        reason: String,
    },
    InstructionInjected {
        text: String,
    },
    IntervalChanged {
        secs: u64,
    },
    PauseRequested {
        secs: Option<u64>,
    },
    ResumeRequested,
    ChatMessageAdded {
        message: ChatMessage,
    },
    ClarificationRequested {
        question: String,
    },
    Commentary {
        text: String,
    },
    ManagerStarted,
    ManagerStopped,
    ManagerReset,
    ManagerError {
        message: String,
    },
    /// Synthesized for a reader whose buffer overflowed.
    SlowObserver {
        missed: u64,
    },
}

impl OfficeEvent {
    /// Stable kind tag, used for log queries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PhaseChanged { .. } => "phase_changed",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::EventsFetched { .. } => "events_fetched",
            Self::NoEventsFound { .. } => "no_events_found",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskAssigned { .. } => "task_assigned",
            Self::TaskQueued { .. } => "task_queued",
            Self::TaskDequeued { .. } => "task_dequeued",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::AssistantSpawned { .. } => "assistant_spawned",
            Self::AssistantProgress { .. } => "assistant_progress",
            Self::AssistantCompleted { .. } => "assistant_completed",
            Self::AssistantFailed { .. } => "assistant_failed",
            Self::AssistantDisposed { .. } => "assistant_disposed",
            Self::AggregationStarted { .. } => "aggregation_started",
            Self::ReportGenerated { .. } => "report_generated",
            Self::RestStarted { .. } => "rest_started",
            Self::RestCountdownTick { .. } => "rest_countdown_tick",
            Self::RestCompleted { .. } => "rest_completed",
            Self::InstructionInjected { .. } => "instruction_injected",
            Self::IntervalChanged { .. } => "interval_changed",
            Self::PauseRequested { .. } => "pause_requested",
            Self::ResumeRequested => "resume_requested",
            Self::ChatMessageAdded { .. } => "chat_message_added",
            Self::ClarificationRequested { .. } => "clarification_requested",
            Self::Commentary { .. } => "commentary",
            Self::ManagerStarted => "manager_started",
            Self::ManagerStopped => "manager_stopped",
            Self::ManagerReset => "manager_reset",
            Self::ManagerError { .. } => "manager_error",
            Self::SlowObserver { .. } => "slow_observer",
        }
    }

    /// Sticky events survive event-log eviction.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            Self::PhaseChanged { .. }
                | Self::IterationStarted { .. }
                | Self::IterationCompleted { .. }
                | Self::ManagerStarted
                | Self::ManagerStopped
                | Self::ManagerReset
                | Self::ManagerError { .. }
        )
    }

    /// Scheduling-decision events, for the scheduling-only log query.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Self::TaskCreated { .. }
                | Self::TaskAssigned { .. }
                | Self::TaskQueued { .. }
                | Self::TaskDequeued { .. }
                | Self::TaskCancelled { .. }
        )
    }
}

/// UI-surface chat record derived from the stream; holds no authoritative
/// state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
    pub ts: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
            ts: Utc::now(),
        }
    }

    pub fn manager(text: impl Into<String>) -> Self {
        Self {
            role: "manager".to_string(),
            text: text.into(),
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = OfficeEvent::TaskQueued {
            task_id: "abc12345".into(),
            position: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_queued");
        assert_eq!(json["task_id"], "abc12345");
        assert_eq!(json["position"], 2);
    }

    #[test]
    fn kind_matches_serde_tag() {
        let events = [
            OfficeEvent::NoEventsFound { iteration: 1 },
            OfficeEvent::ResumeRequested,
            OfficeEvent::ManagerReset,
            OfficeEvent::SlowObserver { missed: 4 },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind());
        }
    }

    #[test]
    fn sticky_and_scheduling_classification() {
        assert!(OfficeEvent::ManagerStarted.is_sticky());
        assert!(OfficeEvent::IterationStarted { iteration: 1 }.is_sticky());
        assert!(!OfficeEvent::Commentary { text: "x".into() }.is_sticky());
        assert!(OfficeEvent::TaskAssigned {
            task_id: "t".into(),
            assistant_index: 1
        }
        .is_scheduling());
        assert!(!OfficeEvent::ManagerStarted.is_scheduling());
    }
}
