//! The assistant role: one task, one session, one result.
//!
//! Lifecycle: Spawned -> Working -> (Completed | Failed) -> Disposed. The
//! session is terminated on every exit path; a failed terminate is a
//! warning, never an error.

use crate::parse;
use opscenter_core::{AssistantResult, AssistantTask, OfficeConfig, OfficeEvent, TaskStatus};
use opscenter_gateway::{
    drain_reply, with_backoff, GatewayError, SessionGateway, SessionSpec, TerminateOnDrop,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimum spacing between AssistantProgress events (<= 10/s).
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct AssistantSettings {
    pub model: String,
    pub working_directory: std::path::PathBuf,
    pub enabled_tools: Vec<String>,
    pub timeout: Duration,
}

impl AssistantSettings {
    pub fn from_config(config: &OfficeConfig) -> Self {
        Self {
            model: config.assistant_model.clone(),
            working_directory: config.working_directory.clone(),
            enabled_tools: config.enabled_tool_providers.clone(),
            timeout: config.assistant_timeout(),
        }
    }
}

fn system_prompt(task: &AssistantTask, index: usize) -> String {
    let metadata = task
        .metadata
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are Assistant #{} in an autonomous operations center. \
         Your task: {}. Category: {}. Context: {}. \
         Complete the task and report: findings, actions taken, outcome, recommendations.",
        index, task.title, task.category, metadata
    )
}

/// Run one task on a fresh session. Returns the terminal status alongside
/// the result; the caller owns the task record and applies the transition.
pub async fn run_assistant(
    gateway: &Arc<dyn SessionGateway>,
    settings: &AssistantSettings,
    task: &AssistantTask,
    prompt: &str,
    assistant_index: usize,
    events: &mpsc::UnboundedSender<OfficeEvent>,
    cancel: &CancellationToken,
) -> (TaskStatus, AssistantResult) {
    let started = Instant::now();
    let _ = events.send(OfficeEvent::AssistantSpawned {
        assistant_index,
        task_id: task.task_id.clone(),
    });

    let outcome = run_inner(
        gateway,
        settings,
        task,
        prompt,
        assistant_index,
        events,
        cancel,
        started,
    )
    .await;

    match &outcome {
        (TaskStatus::Completed, _) => {
            let _ = events.send(OfficeEvent::AssistantCompleted {
                assistant_index,
                task_id: task.task_id.clone(),
            });
        }
        // Cancellation is not a failure; it exits silently.
        (TaskStatus::Cancelled, _) => {}
        (_, result) => {
            let _ = events.send(OfficeEvent::AssistantFailed {
                assistant_index,
                task_id: task.task_id.clone(),
                error: result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            });
        }
    }

    let _ = events.send(OfficeEvent::AssistantDisposed {
        assistant_index,
        task_id: task.task_id.clone(),
    });
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    gateway: &Arc<dyn SessionGateway>,
    settings: &AssistantSettings,
    task: &AssistantTask,
    prompt: &str,
    assistant_index: usize,
    events: &mpsc::UnboundedSender<OfficeEvent>,
    cancel: &CancellationToken,
    started: Instant,
) -> (TaskStatus, AssistantResult) {
    let session_id = format!("assistant-{}-a{}", task.task_id, task.retry_count);
    let spec = SessionSpec::new(&session_id, &settings.model)
        .with_working_directory(settings.working_directory.clone())
        .with_system_prompt(system_prompt(task, assistant_index))
        .with_tools(settings.enabled_tools.clone());

    let handle = match with_backoff("create assistant session", || gateway.create(spec.clone()))
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            return (
                TaskStatus::Failed,
                AssistantResult::failure(
                    task,
                    assistant_index,
                    format!("session create failed: {}", e),
                    task.category.clone(),
                    started.elapsed(),
                ),
            );
        }
    };

    // From here the session is released on every exit path, panics included.
    let guard = TerminateOnDrop::new(handle);

    let sent = guard
        .handle()
        .send(prompt, settings.timeout, cancel.clone())
        .await;

    let drained = match sent {
        Ok(stream) => {
            let mut last_progress = Instant::now() - PROGRESS_INTERVAL;
            let mut streamed = 0usize;
            drain_reply(stream, |delta| {
                streamed += delta.len();
                if last_progress.elapsed() >= PROGRESS_INTERVAL {
                    last_progress = Instant::now();
                    let _ = events.send(OfficeEvent::AssistantProgress {
                        assistant_index,
                        task_id: task.task_id.clone(),
                        chars: streamed,
                    });
                }
            })
            .await
        }
        Err(e) => Err(e),
    };

    let duration = started.elapsed();
    let (status, result) = match drained {
        Ok(reply) => {
            let success = !parse::looks_fatal(&reply.text);
            let mut actions = reply.actions.clone();
            actions.extend(parse::extract_actions(&reply.text));
            if success {
                (
                    TaskStatus::Completed,
                    AssistantResult {
                        task_id: task.task_id.clone(),
                        task_title: task.title.clone(),
                        success: true,
                        summary: parse::extract_summary(&reply.text),
                        response: reply.text,
                        error_message: None,
                        assistant_index,
                        duration,
                        completed_ts: chrono::Utc::now(),
                        category: task.category.clone(),
                        actions_taken: actions,
                    },
                )
            } else {
                let error = reply.text.lines().next().unwrap_or("fatal response").to_string();
                let mut result = AssistantResult::failure(
                    task,
                    assistant_index,
                    error,
                    task.category.clone(),
                    duration,
                );
                result.response = reply.text;
                result.actions_taken = actions;
                (TaskStatus::Failed, result)
            }
        }
        Err(GatewayError::Timeout(limit)) => {
            debug!("assistant {} timed out on {}", assistant_index, task.task_id);
            (
                TaskStatus::Failed,
                AssistantResult::failure(
                    task,
                    assistant_index,
                    format!("timed out after {}s", limit.as_secs()),
                    "timeout",
                    duration,
                ),
            )
        }
        Err(GatewayError::Cancelled) => (
            TaskStatus::Cancelled,
            AssistantResult::cancelled(task, assistant_index, "cancelled"),
        ),
        Err(e) => (
            TaskStatus::Failed,
            AssistantResult::failure(
                task,
                assistant_index,
                e.to_string(),
                task.category.clone(),
                duration,
            ),
        ),
    };

    // Orderly terminate; the guard covers the paths above that return early.
    let handle = guard.disarm();
    handle.terminate().await;
    if cancel.is_cancelled() && status != TaskStatus::Cancelled {
        // Cancellation raced the finish line; the completed work stands.
        warn!("assistant {} finished as cancellation fired", assistant_index);
    }

    (status, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opscenter_gateway::{ScriptedGateway, ScriptedReply};

    fn harness() -> (
        Arc<dyn SessionGateway>,
        ScriptedGateway,
        AssistantSettings,
        mpsc::UnboundedSender<OfficeEvent>,
        mpsc::UnboundedReceiver<OfficeEvent>,
    ) {
        let mock = ScriptedGateway::new();
        let gateway: Arc<dyn SessionGateway> = Arc::new(mock.clone());
        let settings = AssistantSettings {
            model: "m".into(),
            working_directory: ".".into(),
            enabled_tools: Vec::new(),
            timeout: Duration::from_secs(5),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (gateway, mock, settings, tx, rx)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<OfficeEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn successful_run_produces_summary_and_actions() {
        let (gateway, mock, settings, tx, mut rx) = harness();
        mock.script(
            "assistant",
            vec![ScriptedReply::TextWithTools {
                text: "## Summary\nProbe completed.\n\n## Actions\n- pinged the host\n\n## Outcome\nhealthy".into(),
                tools: vec!["ping".into()],
            }],
        );

        let task = AssistantTask::new("Probe host", "probe it", 1);
        let (status, result) =
            run_assistant(&gateway, &settings, &task, &task.prompt, 1, &tx, &CancellationToken::new())
                .await;

        assert_eq!(status, TaskStatus::Completed);
        assert!(result.success);
        assert_eq!(result.summary, "Probe completed.");
        assert_eq!(result.actions_taken, vec!["ping", "pinged the host"]);
        assert_eq!(result.assistant_index, 1);

        let kinds = drain_events(&mut rx);
        assert!(kinds.contains(&"assistant_spawned"));
        assert!(kinds.contains(&"assistant_completed"));
        assert_eq!(*kinds.last().unwrap(), "assistant_disposed");
        // Session released.
        assert_eq!(mock.live_sessions(), 0);
    }

    #[tokio::test]
    async fn fatal_response_fails_without_error_event_loss() {
        let (gateway, mock, settings, tx, mut rx) = harness();
        mock.script(
            "assistant",
            vec![ScriptedReply::Text("FATAL: credentials rejected".into())],
        );

        let task = AssistantTask::new("Rotate key", "rotate", 1);
        let (status, result) =
            run_assistant(&gateway, &settings, &task, &task.prompt, 2, &tx, &CancellationToken::new())
                .await;

        assert_eq!(status, TaskStatus::Failed);
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("FATAL"));
        let kinds = drain_events(&mut rx);
        assert!(kinds.contains(&"assistant_failed"));
        assert!(kinds.contains(&"assistant_disposed"));
        assert_eq!(mock.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_marks_failed_with_timeout_category() {
        let (gateway, mock, settings, tx, _rx) = harness();
        mock.script("assistant", vec![ScriptedReply::Hang]);

        let task = AssistantTask::new("Slow thing", "slow", 1);
        let settings = AssistantSettings {
            timeout: Duration::from_secs(2),
            ..settings
        };
        let (status, result) =
            run_assistant(&gateway, &settings, &task, &task.prompt, 1, &tx, &CancellationToken::new())
                .await;

        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(result.category, "timeout");
        assert!(result.error_message.unwrap().contains("timed out after 2s"));
        assert_eq!(mock.live_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_yields_cancelled_status() {
        let (gateway, mock, settings, tx, _rx) = harness();
        mock.script("assistant", vec![ScriptedReply::Hang]);

        let cancel = CancellationToken::new();
        let task = AssistantTask::new("Interruptible", "work", 1);
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let (status, result) =
            run_assistant(&gateway, &settings, &task, &task.prompt, 1, &tx, &cancel).await;

        assert_eq!(status, TaskStatus::Cancelled);
        assert!(!result.success);
        assert_eq!(mock.live_sessions(), 0);
    }

    #[tokio::test]
    async fn stream_error_is_a_plain_failure() {
        let (gateway, mock, settings, tx, _rx) = harness();
        mock.script(
            "assistant",
            vec![ScriptedReply::StreamError("backend reset".into())],
        );

        let task = AssistantTask::new("Flaky", "work", 1);
        let (status, result) =
            run_assistant(&gateway, &settings, &task, &task.prompt, 1, &tx, &CancellationToken::new())
                .await;

        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(result.category, task.category);
        assert!(result.error_message.unwrap().contains("backend reset"));
    }

    #[test]
    fn system_prompt_shape() {
        let mut task = AssistantTask::new("Check queue", "p", 1).with_category("ops");
        task.metadata.insert("region".into(), "eu".into());
        let prompt = system_prompt(&task, 3);
        assert!(prompt.starts_with("You are Assistant #3 in an autonomous operations center."));
        assert!(prompt.contains("Your task: Check queue."));
        assert!(prompt.contains("Category: ops."));
        assert!(prompt.contains("region=eu"));
        assert!(prompt.ends_with("findings, actions taken, outcome, recommendations."));
    }
}
