//! The assistant pool: a counting semaphore bounding concurrent assistants.
//!
//! The semaphore IS the queue — a task blocked on acquire is, by
//! definition, queued. Submission walks the batch in (priority, created_ts)
//! order so immediate-assignment decisions and assistant indexes are
//! deterministic; everything after that runs concurrently.

use crate::assistant::{run_assistant, AssistantSettings};
use crate::parse;
use opscenter_core::{
    AssistantResult, AssistantTask, OfficeConfig, OfficeEvent, SchedulingAction,
    SchedulingDecision, TaskStatus,
};
use opscenter_gateway::SessionGateway;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_assistants: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_queue_depth: usize,
    pub assistant: AssistantSettings,
}

impl PoolSettings {
    pub fn from_config(config: &OfficeConfig) -> Self {
        Self {
            max_assistants: config.pool_size(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            max_queue_depth: config.max_queue_depth,
            assistant: AssistantSettings::from_config(config),
        }
    }
}

/// Live counters surfaced in status snapshots.
#[derive(Default)]
pub struct PoolGauges {
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl PoolGauges {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// Everything `execute_batch` learned about the batch.
pub struct BatchOutcome {
    /// One result per task, in no particular order.
    pub results: Vec<AssistantResult>,
    pub decisions: Vec<SchedulingDecision>,
    /// Final task records, every one in a terminal status.
    pub tasks: Vec<AssistantTask>,
}

impl BatchOutcome {
    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskStatus::Cancelled)
    }
}

pub struct AssistantPool {
    gateway: Arc<dyn SessionGateway>,
    events: mpsc::UnboundedSender<OfficeEvent>,
    gauges: Arc<PoolGauges>,
}

impl AssistantPool {
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        events: mpsc::UnboundedSender<OfficeEvent>,
        gauges: Arc<PoolGauges>,
    ) -> Self {
        Self {
            gateway,
            events,
            gauges,
        }
    }

    /// Execute a batch of tasks under the concurrency cap. Returns only
    /// after every task reaches a terminal status, even under cancellation.
    pub async fn execute_batch(
        &self,
        mut tasks: Vec<AssistantTask>,
        settings: &PoolSettings,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        tasks.sort_by_key(|t| t.schedule_key());

        let mut results = Vec::new();
        let mut final_tasks = Vec::new();
        let decisions = Arc::new(Mutex::new(Vec::new()));

        // Queue depth limit: the lowest-priority excess never enters the
        // semaphore (ties already broken by created_ts in the sort).
        let admit_cap = if settings.max_queue_depth > 0 {
            settings.max_assistants + settings.max_queue_depth
        } else {
            usize::MAX
        };
        if tasks.len() > admit_cap {
            for mut task in tasks.split_off(admit_cap) {
                task.advance(TaskStatus::Cancelled);
                decisions.lock().unwrap().push(SchedulingDecision::new(
                    &task,
                    SchedulingAction::Cancelled,
                    "queue depth limit",
                ));
                let _ = self.events.send(OfficeEvent::TaskCancelled {
                    task_id: task.task_id.clone(),
                    reason: "queue depth limit".to_string(),
                });
                results.push(AssistantResult::cancelled(&task, 0, "queue depth limit"));
                final_tasks.push(task);
            }
        }

        let ctx = Arc::new(UnitCtx {
            gateway: self.gateway.clone(),
            settings: settings.clone(),
            events: self.events.clone(),
            gauges: self.gauges.clone(),
            decisions: decisions.clone(),
            semaphore: Arc::new(Semaphore::new(settings.max_assistants)),
            slots: Mutex::new(vec![false; settings.max_assistants]),
            waiting: AtomicUsize::new(0),
        });

        // Submission pass: deterministic assignment/queue decisions.
        let submitted: Vec<AssistantTask> = tasks.clone();
        let mut units = Vec::new();
        for mut task in tasks {
            let preassigned = match ctx.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    let index = ctx.allocate_slot();
                    let available = ctx.semaphore.available_permits() + 1;
                    task.advance(TaskStatus::Assigned);
                    ctx.push_decision(
                        SchedulingDecision::new(
                            &task,
                            SchedulingAction::AssignedImmediate,
                            "assistant available at submission",
                        )
                        .assistant(index)
                        .available(available),
                    );
                    let _ = ctx.events.send(OfficeEvent::TaskAssigned {
                        task_id: task.task_id.clone(),
                        assistant_index: index,
                    });
                    Some((permit, index))
                }
                Err(_) => {
                    let position = ctx.waiting.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx.gauges.queued.fetch_add(1, Ordering::SeqCst);
                    task.advance(TaskStatus::Queued);
                    ctx.push_decision(
                        SchedulingDecision::new(
                            &task,
                            SchedulingAction::QueuedPending,
                            "all assistants busy",
                        )
                        .queue_position(position),
                    );
                    let _ = ctx.events.send(OfficeEvent::TaskQueued {
                        task_id: task.task_id.clone(),
                        position,
                    });
                    None
                }
            };

            let ctx = ctx.clone();
            let cancel = cancel.clone();
            units.push(tokio::spawn(async move {
                ctx.run_unit(task, preassigned, cancel).await
            }));
        }

        for (position, unit) in units.into_iter().enumerate() {
            match unit.await {
                Ok((task, result)) => {
                    final_tasks.push(task);
                    results.push(result);
                }
                Err(join_error) => {
                    // A panicked unit still yields a terminal task.
                    warn!("assistant unit panicked: {}", join_error);
                    let mut task = submitted[position].clone();
                    task.status = TaskStatus::Failed;
                    results.push(AssistantResult::failure(
                        &task,
                        0,
                        format!("assistant unit panicked: {}", join_error),
                        task.category.clone(),
                        Duration::ZERO,
                    ));
                    final_tasks.push(task);
                }
            }
        }

        debug_assert!(final_tasks.iter().all(|t| t.status.is_terminal()));
        let decisions = decisions.lock().unwrap().clone();
        BatchOutcome {
            results,
            decisions,
            tasks: final_tasks,
        }
    }
}

struct UnitCtx {
    gateway: Arc<dyn SessionGateway>,
    settings: PoolSettings,
    events: mpsc::UnboundedSender<OfficeEvent>,
    gauges: Arc<PoolGauges>,
    decisions: Arc<Mutex<Vec<SchedulingDecision>>>,
    semaphore: Arc<Semaphore>,
    slots: Mutex<Vec<bool>>,
    waiting: AtomicUsize,
}

impl UnitCtx {
    fn push_decision(&self, decision: SchedulingDecision) {
        self.decisions.lock().unwrap().push(decision);
    }

    /// Lowest free assistant index, 1-based. Recycled on release.
    fn allocate_slot(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        for (i, used) in slots.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return i + 1;
            }
        }
        // More permits than slots cannot happen; the semaphore bounds us.
        slots.push(true);
        slots.len()
    }

    fn free_slot(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        if index >= 1 && index <= slots.len() {
            slots[index - 1] = false;
        }
    }

    fn cancel_task(
        &self,
        mut task: AssistantTask,
        reason: &str,
    ) -> (AssistantTask, AssistantResult) {
        task.advance(TaskStatus::Cancelled);
        self.push_decision(SchedulingDecision::new(
            &task,
            SchedulingAction::Cancelled,
            reason,
        ));
        let _ = self.events.send(OfficeEvent::TaskCancelled {
            task_id: task.task_id.clone(),
            reason: reason.to_string(),
        });
        let result = AssistantResult::cancelled(&task, 0, reason);
        (task, result)
    }

    async fn run_unit(
        self: Arc<Self>,
        mut task: AssistantTask,
        preassigned: Option<(OwnedSemaphorePermit, usize)>,
        cancel: CancellationToken,
    ) -> (AssistantTask, AssistantResult) {
        let (permit, index) = match preassigned {
            Some(pair) => pair,
            None => {
                // Blocked on the semaphore: this IS the queue.
                let acquired = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = self.semaphore.clone().acquire_owned() => permit.ok(),
                };
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                self.gauges.queued.fetch_sub(1, Ordering::SeqCst);
                let Some(permit) = acquired else {
                    return self.cancel_task(task, "cancelled while queued");
                };
                let index = self.allocate_slot();
                let available = self.semaphore.available_permits() + 1;
                task.advance(TaskStatus::Assigned);
                self.push_decision(
                    SchedulingDecision::new(
                        &task,
                        SchedulingAction::DequeuedAndAssigned,
                        "assistant freed",
                    )
                    .assistant(index)
                    .available(available),
                );
                let _ = self.events.send(OfficeEvent::TaskDequeued {
                    task_id: task.task_id.clone(),
                    assistant_index: index,
                });
                let _ = self.events.send(OfficeEvent::TaskAssigned {
                    task_id: task.task_id.clone(),
                    assistant_index: index,
                });
                (permit, index)
            }
        };

        if cancel.is_cancelled() {
            self.free_slot(index);
            drop(permit);
            return self.cancel_task(task, "cancelled before start");
        }

        self.gauges.active.fetch_add(1, Ordering::SeqCst);
        let mut last_error = String::new();
        let mut last_response = String::new();
        let outcome = loop {
            task.advance(TaskStatus::InProgress);
            let prompt = if task.retry_count == 0 {
                task.prompt.clone()
            } else {
                retry_prompt(&task, &last_error, &last_response)
            };
            let (status, result) = run_assistant(
                &self.gateway,
                &self.settings.assistant,
                &task,
                &prompt,
                index,
                &self.events,
                &cancel,
            )
            .await;

            match status {
                TaskStatus::Completed => {
                    task.advance(TaskStatus::Completed);
                    break result;
                }
                TaskStatus::Cancelled => {
                    task.advance(TaskStatus::Cancelled);
                    self.push_decision(SchedulingDecision::new(
                        &task,
                        SchedulingAction::Cancelled,
                        "cancelled in flight",
                    ));
                    let _ = self.events.send(OfficeEvent::TaskCancelled {
                        task_id: task.task_id.clone(),
                        reason: "cancelled in flight".to_string(),
                    });
                    break result;
                }
                _ => {
                    task.advance(TaskStatus::Failed);
                    if task.retry_count < self.settings.max_retries && !cancel.is_cancelled() {
                        last_error = result.error_message.clone().unwrap_or_default();
                        last_response = result.response.clone();
                        task.retry_count += 1;
                        task.advance(TaskStatus::Assigned);
                        self.push_decision(
                            SchedulingDecision::new(
                                &task,
                                SchedulingAction::Retried,
                                format!("retry {} after: {}", task.retry_count, last_error),
                            )
                            .assistant(index),
                        );
                        debug!(
                            "retrying task {} (attempt {})",
                            task.task_id, task.retry_count
                        );
                        let backoff = backoff_delay(self.settings.retry_delay, task.retry_count);
                        let interrupted = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => true,
                            _ = tokio::time::sleep(backoff) => false,
                        };
                        if interrupted {
                            task.advance(TaskStatus::Cancelled);
                            break AssistantResult::cancelled(&task, index, "cancelled during retry backoff");
                        }
                        continue;
                    }
                    break result;
                }
            }
        };

        self.gauges.active.fetch_sub(1, Ordering::SeqCst);
        self.free_slot(index);
        drop(permit);
        (task, outcome)
    }
}

/// Exponential backoff from the configured base, capped at 30 s.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
    (base * factor).min(BACKOFF_CAP)
}

fn retry_prompt(task: &AssistantTask, last_error: &str, last_response: &str) -> String {
    format!(
        "A previous attempt at this task failed: {}\n\
         Previous response (truncated):\n{}\n\n\
         Retry the task, avoiding the failure above.\n\n{}",
        last_error,
        parse::truncate_chars(last_response, 2000),
        task.prompt
    )
}
