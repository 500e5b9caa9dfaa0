//! Tasks, results, reports and scheduling decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Task status lattice. Forward-only, except Failed -> Assigned on retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal forward moves through the lattice. Failed -> Assigned is the
    /// retry edge; the caller checks the retry budget.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Assigned)
                | (Pending, Cancelled)
                | (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Failed, Assigned)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Assigned => write!(f, "assigned"),
            Self::InProgress => write!(f, "in progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Generate an 8-char opaque task id.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Clamp a discovered-event priority into the 1..=5 band (lower = earlier).
pub fn clamp_priority(p: i64) -> u8 {
    p.clamp(1, 5) as u8
}

/// One unit of work handed to an assistant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantTask {
    pub task_id: String,
    pub title: String,
    /// The text actually sent to the assistant session.
    pub prompt: String,
    pub priority: u8,
    pub source_event_id: String,
    pub category: String,
    pub metadata: BTreeMap<String, String>,
    pub iteration: u64,
    pub created_ts: DateTime<Utc>,
    pub status: TaskStatus,
    pub retry_count: u32,
}

impl AssistantTask {
    pub fn new(title: impl Into<String>, prompt: impl Into<String>, iteration: u64) -> Self {
        Self {
            task_id: new_task_id(),
            title: title.into(),
            prompt: prompt.into(),
            priority: 5,
            source_event_id: String::new(),
            category: "general".to_string(),
            metadata: BTreeMap::new(),
            iteration,
            created_ts: Utc::now(),
            status: TaskStatus::Pending,
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = clamp_priority(priority as i64);
        self
    }

    pub fn with_source_event(mut self, event_id: impl Into<String>) -> Self {
        self.source_event_id = event_id.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Advance the status. Illegal moves panic in debug builds; in release
    /// they are applied anyway since the pool already orders transitions.
    pub fn advance(&mut self, next: TaskStatus) {
        debug_assert!(
            self.status.can_advance_to(next),
            "illegal task transition {} -> {} for {}",
            self.status,
            next,
            self.task_id
        );
        self.status = next;
    }

    /// Sort key for batch scheduling: priority ascending, then creation time.
    pub fn schedule_key(&self) -> (u8, DateTime<Utc>) {
        (self.priority, self.created_ts)
    }
}

/// Outcome of one assistant run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssistantResult {
    pub task_id: String,
    pub task_title: String,
    pub success: bool,
    /// Full response text.
    pub response: String,
    /// First paragraph or `## Summary` section of the response.
    pub summary: String,
    pub error_message: Option<String>,
    /// 1..max_assistants within the batch.
    pub assistant_index: usize,
    pub duration: Duration,
    pub completed_ts: DateTime<Utc>,
    /// Mirrors the task category; "timeout" for timeout failures.
    pub category: String,
    pub actions_taken: Vec<String>,
}

impl AssistantResult {
    pub fn failure(
        task: &AssistantTask,
        assistant_index: usize,
        error: impl Into<String>,
        category: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_title: task.title.clone(),
            success: false,
            response: String::new(),
            summary: String::new(),
            error_message: Some(error.into()),
            assistant_index,
            duration,
            completed_ts: Utc::now(),
            category: category.into(),
            actions_taken: Vec::new(),
        }
    }

    pub fn cancelled(task: &AssistantTask, assistant_index: usize, reason: impl Into<String>) -> Self {
        Self::failure(task, assistant_index, reason, task.category.clone(), Duration::ZERO)
    }
}

/// Why and when a task was assigned, queued, dequeued, retried or cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAction {
    AssignedImmediate,
    QueuedPending,
    DequeuedAndAssigned,
    Retried,
    Cancelled,
    SkippedDuplicate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub ts: DateTime<Utc>,
    pub task_id: String,
    pub task_title: String,
    pub action: SchedulingAction,
    pub reason: String,
    pub assigned_assistant_index: Option<usize>,
    pub queue_position_at_time: usize,
    pub available_assistants_at_time: usize,
}

impl SchedulingDecision {
    pub fn new(task: &AssistantTask, action: SchedulingAction, reason: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            task_id: task.task_id.clone(),
            task_title: task.title.clone(),
            action,
            reason: reason.into(),
            assigned_assistant_index: None,
            queue_position_at_time: 0,
            available_assistants_at_time: 0,
        }
    }

    pub fn assistant(mut self, index: usize) -> Self {
        self.assigned_assistant_index = Some(index);
        self
    }

    pub fn queue_position(mut self, position: usize) -> Self {
        self.queue_position_at_time = position;
        self
    }

    pub fn available(mut self, available: usize) -> Self {
        self.available_assistants_at_time = available;
        self
    }
}

/// The record of one complete iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: u64,
    pub started_ts: DateTime<Utc>,
    pub completed_ts: DateTime<Utc>,
    pub events_discovered: usize,
    pub tasks_created: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub tasks_cancelled: usize,
    pub detailed_results: Vec<AssistantResult>,
    pub narrative_summary: String,
    pub recommendations: String,
    pub scheduling_log: Vec<SchedulingDecision>,
}

impl IterationReport {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_ts - self.started_ts
    }

    /// succeeded + failed + cancelled <= created, always.
    pub fn terminal_counts_consistent(&self) -> bool {
        self.tasks_succeeded + self.tasks_failed + self.tasks_cancelled <= self.tasks_created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_8_chars() {
        let id = new_task_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_task_id(), id);
    }

    #[test]
    fn lattice_forward_moves() {
        use TaskStatus::*;
        assert!(Pending.can_advance_to(Queued));
        assert!(Pending.can_advance_to(Assigned));
        assert!(Queued.can_advance_to(Assigned));
        assert!(Assigned.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Completed));
        assert!(InProgress.can_advance_to(Failed));
        assert!(Failed.can_advance_to(Assigned)); // retry edge
    }

    #[test]
    fn lattice_rejects_backward_moves() {
        use TaskStatus::*;
        assert!(!Completed.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Assigned));
        assert!(!InProgress.can_advance_to(Queued));
        assert!(!Cancelled.can_advance_to(Assigned));
        assert!(!Queued.can_advance_to(InProgress)); // must pass Assigned
    }

    #[test]
    fn cancel_reachable_from_every_non_terminal() {
        use TaskStatus::*;
        for s in [Pending, Queued, Assigned, InProgress] {
            assert!(s.can_advance_to(Cancelled), "{} should cancel", s);
        }
    }

    #[test]
    fn priority_clamped() {
        assert_eq!(clamp_priority(-3), 1);
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_priority(3), 3);
        assert_eq!(clamp_priority(99), 5);
        let task = AssistantTask::new("t", "p", 1).with_priority(200);
        assert_eq!(task.priority, 5);
    }

    #[test]
    fn schedule_key_orders_by_priority_then_age() {
        let mut a = AssistantTask::new("a", "p", 1).with_priority(2);
        let b = AssistantTask::new("b", "p", 1).with_priority(1);
        a.created_ts = b.created_ts - chrono::Duration::seconds(10);
        let mut batch = vec![a.clone(), b.clone()];
        batch.sort_by_key(|t| t.schedule_key());
        assert_eq!(batch[0].task_id, b.task_id); // lower priority number first
        assert_eq!(batch[1].task_id, a.task_id);
    }

    #[test]
    fn report_counts_invariant() {
        let report = IterationReport {
            iteration: 1,
            started_ts: Utc::now(),
            completed_ts: Utc::now(),
            events_discovered: 3,
            tasks_created: 3,
            tasks_succeeded: 2,
            tasks_failed: 1,
            tasks_cancelled: 0,
            detailed_results: Vec::new(),
            narrative_summary: String::new(),
            recommendations: String::new(),
            scheduling_log: Vec::new(),
        };
        assert!(report.terminal_counts_consistent());
    }
}
