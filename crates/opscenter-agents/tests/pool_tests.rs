//! Pool scheduling tests: semaphore-as-queue, retries, queue depth,
//! cancellation, and the concurrency invariant.

use opscenter_agents::*;
use opscenter_core::{AssistantTask, OfficeEvent, SchedulingAction, TaskStatus};
use opscenter_gateway::{ScriptedGateway, ScriptedReply, SessionGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    pool: AssistantPool,
    mock: ScriptedGateway,
    gauges: Arc<PoolGauges>,
    events_rx: mpsc::UnboundedReceiver<OfficeEvent>,
}

fn harness() -> Harness {
    let mock = ScriptedGateway::new();
    let gateway: Arc<dyn SessionGateway> = Arc::new(mock.clone());
    let gauges = Arc::new(PoolGauges::default());
    let (tx, events_rx) = mpsc::unbounded_channel();
    Harness {
        pool: AssistantPool::new(gateway, tx, gauges.clone()),
        mock,
        gauges,
        events_rx,
    }
}

fn settings(max_assistants: usize) -> PoolSettings {
    PoolSettings {
        max_assistants,
        max_retries: 1,
        retry_delay: Duration::from_secs(2),
        max_queue_depth: 0,
        assistant: AssistantSettings {
            model: "m".into(),
            working_directory: ".".into(),
            enabled_tools: Vec::new(),
            timeout: Duration::from_secs(60),
        },
    }
}

fn task(title: &str, priority: u8) -> AssistantTask {
    AssistantTask::new(title, format!("handle {}", title), 1).with_priority(priority)
}

fn actions_for(outcome: &BatchOutcome, title: &str) -> Vec<SchedulingAction> {
    outcome
        .decisions
        .iter()
        .filter(|d| d.task_title == title)
        .map(|d| d.action)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn three_tasks_two_assistants_queue_and_dequeue() {
    let h = harness();
    // Replies take a moment so the third task genuinely queues.
    h.mock.script(
        "assistant",
        (0..3)
            .map(|_| ScriptedReply::DelayedText {
                delay: Duration::from_secs(1),
                text: "done".into(),
            })
            .collect(),
    );

    let tasks = vec![task("E1", 1), task("E2", 2), task("E3", 3)];
    let outcome = h
        .pool
        .execute_batch(tasks, &settings(2), &CancellationToken::new())
        .await;

    assert_eq!(outcome.succeeded(), 3);
    assert_eq!(outcome.failed(), 0);
    assert_eq!(outcome.cancelled(), 0);

    assert_eq!(
        actions_for(&outcome, "E1"),
        vec![SchedulingAction::AssignedImmediate]
    );
    assert_eq!(
        actions_for(&outcome, "E2"),
        vec![SchedulingAction::AssignedImmediate]
    );
    assert_eq!(
        actions_for(&outcome, "E3"),
        vec![
            SchedulingAction::QueuedPending,
            SchedulingAction::DequeuedAndAssigned
        ]
    );

    // Deterministic index assignment in submission order.
    let e1 = outcome
        .decisions
        .iter()
        .find(|d| d.task_title == "E1")
        .unwrap();
    assert_eq!(e1.assigned_assistant_index, Some(1));
    assert!(e1.available_assistants_at_time >= 1);
    let e2 = outcome
        .decisions
        .iter()
        .find(|d| d.task_title == "E2")
        .unwrap();
    assert_eq!(e2.assigned_assistant_index, Some(2));

    // Gauges settle back to zero.
    assert_eq!(h.gauges.active(), 0);
    assert_eq!(h.gauges.queued(), 0);
    assert_eq!(h.mock.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn priority_orders_submission_not_creation() {
    let h = harness();
    let tasks = vec![task("low", 5), task("high", 1), task("mid", 3)];
    let outcome = h
        .pool
        .execute_batch(tasks, &settings(1), &CancellationToken::new())
        .await;

    // With one assistant, only the highest priority task assigns
    // immediately; the others queue.
    assert_eq!(
        actions_for(&outcome, "high"),
        vec![SchedulingAction::AssignedImmediate]
    );
    assert_eq!(
        actions_for(&outcome, "low")[0],
        SchedulingAction::QueuedPending
    );
    assert_eq!(
        actions_for(&outcome, "mid")[0],
        SchedulingAction::QueuedPending
    );
    assert_eq!(outcome.succeeded(), 3);
}

#[tokio::test(start_paused = true)]
async fn timeout_then_retry_succeeds() {
    let h = harness();
    // First attempt hangs past the 2 s timeout; the retry answers.
    h.mock.script(
        "assistant",
        vec![
            ScriptedReply::Hang,
            ScriptedReply::Text("## Summary\nfixed on retry".into()),
        ],
    );

    let mut settings = settings(1);
    settings.assistant.timeout = Duration::from_secs(2);
    let tasks = vec![task("E1", 1)];
    let outcome = h
        .pool
        .execute_batch(tasks, &settings, &CancellationToken::new())
        .await;

    assert_eq!(outcome.succeeded(), 1);
    assert_eq!(outcome.tasks[0].retry_count, 1);
    assert_eq!(outcome.tasks[0].status, TaskStatus::Completed);

    let retried: Vec<_> = outcome
        .decisions
        .iter()
        .filter(|d| d.action == SchedulingAction::Retried)
        .collect();
    assert_eq!(retried.len(), 1);
    assert!(retried[0].reason.contains("timed out"));

    // The retry prompt carries the failure context.
    let second_session = format!("assistant-{}-a1", outcome.tasks[0].task_id);
    let retry_prompts = h.mock.prompts_for(&second_session);
    assert_eq!(retry_prompts.len(), 1);
    assert!(retry_prompts[0].contains("previous attempt at this task failed"));
    assert!(retry_prompts[0].contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn retries_exhaust_into_failure() {
    let h = harness();
    h.mock.script(
        "assistant",
        vec![
            ScriptedReply::Text("FATAL: broken".into()),
            ScriptedReply::Text("FATAL: still broken".into()),
        ],
    );

    let outcome = h
        .pool
        .execute_batch(vec![task("E1", 1)], &settings(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome.failed(), 1);
    assert_eq!(outcome.tasks[0].retry_count, 1);
    assert_eq!(outcome.tasks[0].status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn queue_depth_limit_cancels_lowest_priority_excess() {
    let h = harness();
    h.mock.script(
        "assistant",
        (0..5)
            .map(|_| ScriptedReply::DelayedText {
                delay: Duration::from_millis(500),
                text: "done".into(),
            })
            .collect(),
    );

    let mut settings = settings(2);
    settings.max_queue_depth = 3;
    let tasks = (1..=6).map(|i| task(&format!("E{}", i), i as u8)).collect();
    let outcome = h
        .pool
        .execute_batch(tasks, &settings, &CancellationToken::new())
        .await;

    assert_eq!(outcome.cancelled(), 1);
    assert_eq!(outcome.succeeded(), 5);
    let cancelled: Vec<_> = outcome
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Cancelled)
        .collect();
    assert_eq!(cancelled[0].title, "E6");
    let decision = outcome
        .decisions
        .iter()
        .find(|d| d.action == SchedulingAction::Cancelled)
        .unwrap();
    assert_eq!(decision.reason, "queue depth limit");
    // E6 never opened a session.
    assert_eq!(h.mock.created_sessions().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_the_cap() {
    let h = harness();
    h.mock.script(
        "assistant",
        (0..6)
            .map(|_| ScriptedReply::DelayedText {
                delay: Duration::from_secs(1),
                text: "done".into(),
            })
            .collect(),
    );

    let tasks = (1..=6).map(|i| task(&format!("T{}", i), 3)).collect();
    let outcome = h
        .pool
        .execute_batch(tasks, &settings(2), &CancellationToken::new())
        .await;

    assert_eq!(outcome.succeeded(), 6);
    assert!(
        h.mock.peak_live_sessions() <= 2,
        "peak {} exceeded cap",
        h.mock.peak_live_sessions()
    );
}

#[tokio::test(start_paused = true)]
async fn single_assistant_degenerates_to_serial() {
    let h = harness();
    h.mock.script(
        "assistant",
        (0..4)
            .map(|_| ScriptedReply::DelayedText {
                delay: Duration::from_millis(100),
                text: "done".into(),
            })
            .collect(),
    );

    let tasks = (1..=4).map(|i| task(&format!("T{}", i), 3)).collect();
    let outcome = h
        .pool
        .execute_batch(tasks, &settings(1), &CancellationToken::new())
        .await;

    assert_eq!(outcome.succeeded(), 4);
    assert_eq!(h.mock.peak_live_sessions(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_settles_every_task() {
    let mut h = harness();
    h.mock
        .script("assistant", (0..4).map(|_| ScriptedReply::Hang).collect());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let tasks = (1..=4).map(|i| task(&format!("T{}", i), 3)).collect();
    let outcome = h.pool.execute_batch(tasks, &settings(2), &cancel).await;

    assert_eq!(outcome.tasks.len(), 4);
    assert_eq!(outcome.cancelled(), 4);
    assert!(outcome.tasks.iter().all(|t| t.status.is_terminal()));
    // Hung sessions were aborted and released.
    assert_eq!(h.mock.live_sessions(), 0);

    // Queued tasks saw TaskCancelled, not TaskDequeued.
    let mut kinds = Vec::new();
    while let Ok(event) = h.events_rx.try_recv() {
        kinds.push(event.kind().to_string());
    }
    assert!(kinds.iter().any(|k| k == "task_cancelled"));
    assert!(!kinds.iter().any(|k| k == "task_dequeued"));
}

#[tokio::test]
async fn empty_batch_returns_immediately() {
    let h = harness();
    let outcome = h
        .pool
        .execute_batch(Vec::new(), &settings(2), &CancellationToken::new())
        .await;
    assert!(outcome.results.is_empty());
    assert!(outcome.decisions.is_empty());
    assert!(outcome.tasks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn lifecycle_events_flow_for_each_task() {
    let mut h = harness();
    h.mock.script(
        "assistant",
        vec![ScriptedReply::Text("## Summary\nok".into())],
    );

    let outcome = h
        .pool
        .execute_batch(vec![task("E1", 1)], &settings(2), &CancellationToken::new())
        .await;
    assert_eq!(outcome.succeeded(), 1);

    let mut kinds = Vec::new();
    while let Ok(event) = h.events_rx.try_recv() {
        kinds.push(event.kind().to_string());
    }
    for expected in [
        "task_assigned",
        "assistant_spawned",
        "assistant_completed",
        "assistant_disposed",
    ] {
        assert!(kinds.iter().any(|k| k == expected), "missing {}", expected);
    }
}
