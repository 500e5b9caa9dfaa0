//! The manager orchestrator: the eleven-phase state machine, the iteration
//! loop, and the control surface.
//!
//! One cooperative driver task owns the loop and the manager session; the
//! control surface talks to it through channels and shared state. Stop is
//! cooperative (the iteration drains, assistants finish); Reset cancels the
//! master token and tears everything down.

use crate::brief::BriefStore;
use crate::context::ManagerContext;
use crate::log::EventLog;
use crate::scheduler::{IntervalScheduler, WaitOutcome};
use crate::stream::{spawn_event_pump, EventHub, EventSubscription};
use chrono::{DateTime, Utc};
use opscenter_agents::parse::DiscoveredEvent;
use opscenter_agents::{
    answer_follow_up, AssistantPool, Clarity, ClarifyOutcome, ManagerAgent, ManagerCallError,
    ManagerSettings, PoolGauges, PoolSettings,
};
use opscenter_core::{
    AssistantTask, ChatMessage, Error, IterationReport, ManagerPhase, OfficeConfig, OfficeEvent,
    Result, SchedulingAction, SchedulingDecision,
};
use opscenter_gateway::SessionGateway;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rest duration used for pause-with-no-duration.
const INDEFINITE_REST: Duration = Duration::from_secs(365 * 24 * 3600);

/// How a mid-run instruction was handled.
#[derive(Clone, Debug)]
pub enum InjectionOutcome {
    /// Queued for the next iteration boundary.
    Queued,
    /// The manager needs an answer before the instruction can be queued.
    NeedsClarification(String),
    /// A status meta-question, answered from local state without an LLM call.
    MetaAnswer(String),
}

/// Read-only view of the office for status surfaces.
#[derive(Clone, Debug, serde::Serialize)]
pub struct OfficeSnapshot {
    pub phase: ManagerPhase,
    pub completed_iterations: u64,
    pub active_assistants: usize,
    pub queued_tasks: usize,
    pub rest_remaining_secs: u64,
    pub next_iteration_due: Option<DateTime<Utc>>,
}

enum PlanDecision {
    Approved,
    Rejected(String),
}

struct ClarityDialog {
    original: String,
    answers: Vec<String>,
    clarify_rounds: u32,
}

impl ClarityDialog {
    fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            answers: Vec::new(),
            clarify_rounds: 1,
        }
    }

    /// Best concatenation so far: the instruction plus every answer.
    fn concatenation(&self) -> String {
        let mut parts = vec![self.original.clone()];
        parts.extend(self.answers.iter().cloned());
        parts.join("; ")
    }
}

#[derive(Clone)]
pub struct Office {
    shared: Arc<Shared>,
}

struct Shared {
    gateway: Arc<dyn SessionGateway>,
    config: StdRwLock<OfficeConfig>,
    phase_tx: watch::Sender<ManagerPhase>,
    context: StdMutex<ManagerContext>,
    log: Arc<EventLog>,
    hub: EventHub,
    bus: mpsc::UnboundedSender<OfficeEvent>,
    scheduler: IntervalScheduler,
    gauges: Arc<PoolGauges>,
    pool: AssistantPool,
    manager: TokioMutex<Option<ManagerAgent>>,
    user_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    plan_tx: StdMutex<Option<mpsc::UnboundedSender<PlanDecision>>>,
    stopping: AtomicBool,
    stop_tx: watch::Sender<u64>,
    cancel: StdMutex<CancellationToken>,
    driver: TokioMutex<Option<JoinHandle<()>>>,
    clarity: StdMutex<Option<ClarityDialog>>,
    pending_pause: StdMutex<Option<Duration>>,
    history: StdMutex<Vec<IterationReport>>,
    brief: BriefStore,
}

impl Shared {
    fn phase(&self) -> ManagerPhase {
        *self.phase_tx.borrow()
    }

    fn emit(&self, event: OfficeEvent) {
        let _ = self.bus.send(event);
    }

    fn set_phase(&self, to: ManagerPhase) {
        let from = self.phase();
        if from == to {
            return;
        }
        debug_assert!(
            from.can_transition(to),
            "illegal phase transition {} -> {}",
            from,
            to
        );
        let _ = self.phase_tx.send(to);
        self.emit(OfficeEvent::PhaseChanged { from, to });
    }

    fn config_snapshot(&self) -> OfficeConfig {
        self.config.read().unwrap().clone()
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn fail_fatal(&self, message: &str) {
        warn!("office entering error phase: {}", message);
        self.emit(OfficeEvent::ManagerError {
            message: message.to_string(),
        });
        self.set_phase(ManagerPhase::Error);
    }

    fn finalize_stopped(&self) {
        self.set_phase(ManagerPhase::Stopped);
        self.emit(OfficeEvent::ManagerStopped);
        info!("office stopped");
    }
}

impl Office {
    /// Build an office over a gateway. Must be called inside a runtime (the
    /// event pump is spawned here).
    pub fn new(gateway: Arc<dyn SessionGateway>) -> Self {
        let log = Arc::new(EventLog::new());
        let (bus, hub) = spawn_event_pump(log.clone());
        let gauges = Arc::new(PoolGauges::default());
        let pool = AssistantPool::new(gateway.clone(), bus.clone(), gauges.clone());
        let (phase_tx, _) = watch::channel(ManagerPhase::Idle);
        let (stop_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                gateway,
                config: StdRwLock::new(OfficeConfig::default()),
                phase_tx,
                context: StdMutex::new(ManagerContext::default()),
                log,
                hub,
                bus,
                scheduler: IntervalScheduler::new(),
                gauges,
                pool,
                manager: TokioMutex::new(None),
                user_tx: StdMutex::new(None),
                plan_tx: StdMutex::new(None),
                stopping: AtomicBool::new(false),
                stop_tx,
                cancel: StdMutex::new(CancellationToken::new()),
                driver: TokioMutex::new(None),
                clarity: StdMutex::new(None),
                pending_pause: StdMutex::new(None),
                history: StdMutex::new(Vec::new()),
                brief: BriefStore::new(),
            }),
        }
    }

    // -----------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------

    /// Initialize context and begin Clarifying. Valid only while Idle.
    pub async fn start(&self, config: OfficeConfig) -> Result<()> {
        let shared = &self.shared;
        let phase = shared.phase();
        if phase != ManagerPhase::Idle {
            return Err(Error::control_rejected("start", phase));
        }

        *shared.config.write().unwrap() = config.clone();
        *shared.context.lock().unwrap() = ManagerContext::new(&config.master_prompt);
        shared.stopping.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *shared.cancel.lock().unwrap() = cancel.clone();

        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (plan_tx, plan_rx) = mpsc::unbounded_channel();
        *shared.user_tx.lock().unwrap() = Some(user_tx);
        *shared.plan_tx.lock().unwrap() = Some(plan_tx);

        let driver_shared = shared.clone();
        let handle = tokio::spawn(async move {
            drive(driver_shared, user_rx, plan_rx, cancel).await;
        });
        *shared.driver.lock().await = Some(handle);
        info!("office started");
        Ok(())
    }

    /// Answer the manager: a clarification answer while Clarifying, or the
    /// next turn of an active mid-run clarity sub-dialog.
    pub async fn user_response(&self, text: &str) -> Result<()> {
        let phase = self.phase();
        if phase == ManagerPhase::Clarifying {
            self.shared.emit(OfficeEvent::ChatMessageAdded {
                message: ChatMessage::user(text),
            });
            let guard = self.shared.user_tx.lock().unwrap();
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(text.to_string());
                return Ok(());
            }
            return Err(Error::control_rejected("user_response", phase));
        }
        if self.shared.clarity.lock().unwrap().is_some() {
            self.shared.emit(OfficeEvent::ChatMessageAdded {
                message: ChatMessage::user(text),
            });
            self.continue_clarity(text).await?;
            return Ok(());
        }
        Err(Error::control_rejected("user_response", phase))
    }

    pub fn approve_plan(&self) -> Result<()> {
        self.send_plan_decision("approve_plan", PlanDecision::Approved)
    }

    pub fn reject_plan(&self, feedback: &str) -> Result<()> {
        self.send_plan_decision(
            "reject_plan",
            PlanDecision::Rejected(feedback.to_string()),
        )
    }

    fn send_plan_decision(&self, op: &'static str, decision: PlanDecision) -> Result<()> {
        let phase = self.phase();
        if phase != ManagerPhase::AwaitingApproval {
            return Err(Error::control_rejected(op, phase));
        }
        let guard = self.shared.plan_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(decision);
            Ok(())
        } else {
            Err(Error::control_rejected(op, phase))
        }
    }

    /// Route a mid-run user instruction: meta-questions are answered from
    /// local state; while the manager session is idle the instruction goes
    /// through clarity evaluation; otherwise it is queued verbatim.
    pub async fn inject_instruction(&self, text: &str) -> Result<InjectionOutcome> {
        let phase = self.phase();
        if !phase.accepts_injection() {
            return Err(Error::control_rejected("inject_instruction", phase));
        }
        self.shared.emit(OfficeEvent::ChatMessageAdded {
            message: ChatMessage::user(text),
        });

        if is_meta_question(text) {
            return Ok(InjectionOutcome::MetaAnswer(self.render_status()));
        }

        if phase.manager_session_idle() {
            match self.evaluate_clarity(text).await {
                Clarity::Clear => {
                    self.queue_instruction(text);
                    Ok(InjectionOutcome::Queued)
                }
                Clarity::Clarify(question) => {
                    *self.shared.clarity.lock().unwrap() = Some(ClarityDialog::new(text));
                    self.shared.emit(OfficeEvent::ClarificationRequested {
                        question: question.clone(),
                    });
                    Ok(InjectionOutcome::NeedsClarification(question))
                }
            }
        } else {
            self.queue_instruction(text);
            Ok(InjectionOutcome::Queued)
        }
    }

    async fn continue_clarity(&self, answer: &str) -> Result<InjectionOutcome> {
        let Some(mut dialog) = self.shared.clarity.lock().unwrap().take() else {
            return Err(Error::control_rejected("user_response", self.phase()));
        };
        dialog.answers.push(answer.to_string());
        let concatenation = dialog.concatenation();

        if !self.phase().manager_session_idle() {
            // The window closed mid-dialog; queue what we have.
            self.queue_instruction(&concatenation);
            return Ok(InjectionOutcome::Queued);
        }

        match self.evaluate_clarity(&concatenation).await {
            Clarity::Clear => {
                self.queue_instruction(&concatenation);
                Ok(InjectionOutcome::Queued)
            }
            Clarity::Clarify(question) => {
                dialog.clarify_rounds += 1;
                if dialog.clarify_rounds >= 3 {
                    // Third CLARIFY round: force-queue the best concatenation.
                    self.queue_instruction(&concatenation);
                    Ok(InjectionOutcome::Queued)
                } else {
                    self.shared.emit(OfficeEvent::ClarificationRequested {
                        question: question.clone(),
                    });
                    *self.shared.clarity.lock().unwrap() = Some(dialog);
                    Ok(InjectionOutcome::NeedsClarification(question))
                }
            }
        }
    }

    async fn evaluate_clarity(&self, text: &str) -> Clarity {
        let cancel = self.shared.cancel.lock().unwrap().clone();
        let mut guard = self.shared.manager.lock().await;
        match guard.as_mut() {
            Some(manager) => match manager.evaluate_clarity(text, &cancel).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!("clarity evaluation failed ({}); queueing verbatim", e);
                    Clarity::Clear
                }
            },
            None => Clarity::Clear,
        }
    }

    fn queue_instruction(&self, text: &str) {
        let added = self.shared.context.lock().unwrap().inject(text);
        if added {
            self.shared.emit(OfficeEvent::InstructionInjected {
                text: text.to_string(),
            });
        }
    }

    /// Answer a question against the knowledge brief. Valid once Stopped.
    pub async fn follow_up(&self, question: &str) -> Result<String> {
        let phase = self.phase();
        if phase != ManagerPhase::Stopped {
            return Err(Error::control_rejected("follow_up", phase));
        }
        self.shared.emit(OfficeEvent::ChatMessageAdded {
            message: ChatMessage::user(question),
        });
        let brief = self.shared.brief.render();
        let settings = ManagerSettings::from_config(&self.shared.config_snapshot());
        let cancel = self.shared.cancel.lock().unwrap().clone();
        match answer_follow_up(&self.shared.gateway, &settings, &brief, question, &cancel).await {
            Ok(answer) => {
                self.shared.emit(OfficeEvent::ChatMessageAdded {
                    message: ChatMessage::manager(&answer),
                });
                Ok(answer)
            }
            Err(e) => Err(Error::manager_session(e.to_string())),
        }
    }

    /// Change the rest interval: live during Resting, else from the next
    /// Resting entry.
    pub fn update_interval(&self, interval: Duration) -> Result<()> {
        self.shared.config.write().unwrap().interval_secs = interval.as_secs();
        self.shared.emit(OfficeEvent::IntervalChanged {
            secs: interval.as_secs(),
        });
        if self.phase() == ManagerPhase::Resting {
            let elapsed = self.shared.scheduler.elapsed();
            self.shared
                .scheduler
                .override_remaining(interval.saturating_sub(elapsed));
        }
        Ok(())
    }

    /// Change the pool size; takes effect on the next iteration.
    pub fn update_pool_size(&self, size: usize) -> Result<()> {
        let size = size.max(1);
        self.shared.config.write().unwrap().max_assistants = size;
        self.shared.emit(OfficeEvent::Commentary {
            text: format!("assistant pool size set to {}", size),
        });
        Ok(())
    }

    /// Pause: a scheduler override while Resting, or an extended rest at
    /// the next boundary. Valid only while an iteration is running; no
    /// assistant is ever paused mid-task.
    pub fn pause(&self, duration: Option<Duration>) -> Result<()> {
        let phase = self.phase();
        if !phase.is_running() {
            return Err(Error::control_rejected("pause", phase));
        }
        let rest = duration.unwrap_or(INDEFINITE_REST);
        self.shared.emit(OfficeEvent::PauseRequested {
            secs: duration.map(|d| d.as_secs()),
        });
        if phase == ManagerPhase::Resting {
            self.shared.scheduler.override_remaining(rest);
        } else {
            *self.shared.pending_pause.lock().unwrap() = Some(rest);
        }
        Ok(())
    }

    /// Wake a resting office now; also clears any pending pause. Valid
    /// only while Resting.
    pub fn resume(&self) -> Result<()> {
        let phase = self.phase();
        if phase != ManagerPhase::Resting {
            return Err(Error::control_rejected("resume", phase));
        }
        self.shared.emit(OfficeEvent::ResumeRequested);
        *self.shared.pending_pause.lock().unwrap() = None;
        self.shared.scheduler.wake_now();
        Ok(())
    }

    /// Cooperative stop: the current iteration drains to Aggregating,
    /// Resting is skipped, in-flight assistants run to completion.
    pub fn stop(&self) -> Result<()> {
        let phase = self.phase();
        if matches!(
            phase,
            ManagerPhase::Idle | ManagerPhase::Stopped | ManagerPhase::Error
        ) {
            return Err(Error::control_rejected("stop", phase));
        }
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.stop_tx.send_modify(|n| *n += 1);
        if phase == ManagerPhase::Resting {
            self.shared.scheduler.wake_now();
        }
        info!("stop requested");
        Ok(())
    }

    /// Hard reset: cancel everything, terminate every session, clear
    /// context, return to Idle. The only exit from Error.
    pub async fn reset(&self) {
        let shared = &self.shared;
        let cancel = shared.cancel.lock().unwrap().clone();
        cancel.cancel();

        if let Some(mut handle) = shared.driver.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                let _ = handle.await;
            }
        }
        if let Some(manager) = shared.manager.lock().await.take() {
            manager.terminate().await;
        }

        *shared.context.lock().unwrap() = ManagerContext::default();
        shared.history.lock().unwrap().clear();
        shared.brief.clear();
        *shared.clarity.lock().unwrap() = None;
        *shared.pending_pause.lock().unwrap() = None;
        *shared.user_tx.lock().unwrap() = None;
        *shared.plan_tx.lock().unwrap() = None;
        shared.stopping.store(false, Ordering::SeqCst);

        shared.set_phase(ManagerPhase::Idle);
        shared.emit(OfficeEvent::ManagerReset);
        info!("office reset");
    }

    // -----------------------------------------------------------------
    // Observability surface
    // -----------------------------------------------------------------

    pub fn phase(&self) -> ManagerPhase {
        self.shared.phase()
    }

    pub fn config(&self) -> OfficeConfig {
        self.shared.config_snapshot()
    }

    pub fn phase_watch(&self) -> watch::Receiver<ManagerPhase> {
        self.shared.phase_tx.subscribe()
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.shared.hub.subscribe()
    }

    pub fn log(&self) -> Arc<EventLog> {
        self.shared.log.clone()
    }

    pub fn history(&self) -> Vec<IterationReport> {
        self.shared.history.lock().unwrap().clone()
    }

    pub fn brief(&self) -> crate::brief::KnowledgeBrief {
        self.shared.brief.snapshot()
    }

    pub fn injected_instructions(&self) -> Vec<String> {
        self.shared
            .context
            .lock()
            .unwrap()
            .injected_instructions()
            .to_vec()
    }

    pub fn learnings(&self) -> Vec<String> {
        self.shared.context.lock().unwrap().learnings.clone()
    }

    pub fn effective_prompt(&self) -> String {
        self.shared.context.lock().unwrap().effective_prompt.clone()
    }

    pub fn approved_plan(&self) -> Option<String> {
        self.shared.context.lock().unwrap().approved_plan.clone()
    }

    pub fn snapshot(&self) -> OfficeSnapshot {
        let context = self.shared.context.lock().unwrap();
        OfficeSnapshot {
            phase: self.phase(),
            completed_iterations: context.completed_iterations,
            active_assistants: self.shared.gauges.active(),
            queued_tasks: self.shared.gauges.queued(),
            rest_remaining_secs: self.shared.scheduler.remaining().as_secs(),
            next_iteration_due: context.next_iteration_due,
        }
    }

    /// The fixed meta-question template, filled from local state.
    pub fn render_status(&self) -> String {
        let snapshot = self.snapshot();
        let due = match snapshot.next_iteration_due {
            Some(due) if snapshot.phase == ManagerPhase::Resting => {
                format!("in {}s (at {})", snapshot.rest_remaining_secs, due.format("%H:%M:%S"))
            }
            _ => "after the current phase completes".to_string(),
        };
        format!(
            "Currently {}. Completed iterations: {}. Active assistants: {}; queued tasks: {}. \
             Next iteration: {}. Available controls: pause, resume, stop, reset, \
             update interval, update pool size.",
            snapshot.phase,
            snapshot.completed_iterations,
            snapshot.active_assistants,
            snapshot.queued_tasks,
            due
        )
    }
}

/// Status meta-question heuristic: a question about progress, not an
/// instruction that merely mentions one of the keywords.
pub fn is_meta_question(text: &str) -> bool {
    let lower = text.to_lowercase();
    let keyword = ["status", "progress", "how long", "how far"]
        .iter()
        .any(|k| lower.contains(k))
        || lower
            .split_whitespace()
            .any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == "eta");
    let interrogative = lower.trim_end().ends_with('?')
        || lower.starts_with("what")
        || lower.starts_with("how")
        || lower.starts_with("where")
        || lower.starts_with("when");
    keyword && interrogative
}

fn manager_system_prompt(config: &OfficeConfig) -> String {
    format!(
        "You are the Manager of an autonomous operations center. You clarify the \
         user's objective, produce an execution plan, discover work with your \
         tools each iteration, delegate tasks to assistants, and aggregate their \
         results.\n\nStanding objective: {}\n\nWorking directory: {}",
        config.master_prompt,
        config.working_directory.display()
    )
}

fn build_task(event: &DiscoveredEvent, iteration: u64, effective_prompt: &str) -> AssistantTask {
    let mut prompt = event.title.clone();
    if !event.description.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(&event.description);
    }
    if !effective_prompt.is_empty() {
        prompt.push_str("\n\nStanding objective and instructions:\n");
        prompt.push_str(effective_prompt);
    }
    let mut task = AssistantTask::new(&event.title, prompt, iteration)
        .with_priority(event.priority.clamp(1, 5) as u8)
        .with_source_event(&event.event_id)
        .with_category(&event.category);
    task.metadata = event.metadata_map();
    task
}

// ---------------------------------------------------------------------
// The driver: one cooperative task that owns the state machine.
// ---------------------------------------------------------------------

async fn drive(
    shared: Arc<Shared>,
    mut user_rx: mpsc::UnboundedReceiver<String>,
    mut plan_rx: mpsc::UnboundedReceiver<PlanDecision>,
    cancel: CancellationToken,
) {
    let mut stop_rx = shared.stop_tx.subscribe();
    stop_rx.borrow_and_update();

    shared.emit(OfficeEvent::ManagerStarted);
    shared.set_phase(ManagerPhase::Clarifying);

    let config = shared.config_snapshot();
    let settings = ManagerSettings::from_config(&config);
    let system_prompt = manager_system_prompt(&config);
    match ManagerAgent::connect(shared.gateway.clone(), settings, system_prompt).await {
        Ok(manager) => *shared.manager.lock().await = Some(manager),
        Err(ManagerCallError::Cancelled) => return,
        Err(ManagerCallError::Failed(message)) => {
            shared.fail_fatal(&message);
            return;
        }
    }

    // --- Clarification ---
    let objective = config.master_prompt.clone();
    let mut outcome = {
        let mut guard = shared.manager.lock().await;
        let Some(manager) = guard.as_mut() else { return };
        match manager.clarify_objective(&objective, &cancel).await {
            Ok(outcome) => outcome,
            Err(ManagerCallError::Cancelled) => return,
            Err(ManagerCallError::Failed(message)) => {
                shared.fail_fatal(&message);
                return;
            }
        }
    };
    loop {
        match outcome {
            ClarifyOutcome::Ready => break,
            ClarifyOutcome::Question(question) => {
                shared.emit(OfficeEvent::ClarificationRequested {
                    question: question.clone(),
                });
                shared.emit(OfficeEvent::ChatMessageAdded {
                    message: ChatMessage::manager(&question),
                });
                let answer = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = stop_rx.changed() => {
                        shared.finalize_stopped();
                        return;
                    }
                    answer = user_rx.recv() => match answer {
                        Some(answer) => answer,
                        None => return,
                    },
                };
                shared
                    .context
                    .lock()
                    .unwrap()
                    .record_clarification(&question, &answer);
                outcome = {
                    let mut guard = shared.manager.lock().await;
                    let Some(manager) = guard.as_mut() else { return };
                    match manager.answer_clarification(&answer, &cancel).await {
                        Ok(outcome) => outcome,
                        Err(ManagerCallError::Cancelled) => return,
                        Err(ManagerCallError::Failed(message)) => {
                            shared.fail_fatal(&message);
                            return;
                        }
                    }
                };
            }
        }
    }

    // --- Planning and approval ---
    let mut feedback: Option<String> = None;
    loop {
        shared.set_phase(ManagerPhase::Planning);
        let plan = {
            let mut guard = shared.manager.lock().await;
            let Some(manager) = guard.as_mut() else { return };
            match manager.create_plan(feedback.as_deref(), &cancel).await {
                Ok(plan) => plan,
                Err(ManagerCallError::Cancelled) => return,
                Err(ManagerCallError::Failed(message)) => {
                    shared.fail_fatal(&message);
                    return;
                }
            }
        };
        shared.emit(OfficeEvent::ChatMessageAdded {
            message: ChatMessage::manager(&plan),
        });

        let decision = if config.auto_approve_plan {
            shared.set_phase(ManagerPhase::AwaitingApproval);
            PlanDecision::Approved
        } else {
            // Stale decisions from an earlier round do not apply; drain
            // before the phase change opens the approval window.
            while plan_rx.try_recv().is_ok() {}
            shared.set_phase(ManagerPhase::AwaitingApproval);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = stop_rx.changed() => {
                    shared.finalize_stopped();
                    return;
                }
                decision = plan_rx.recv() => match decision {
                    Some(decision) => decision,
                    None => return,
                },
            }
        };
        match decision {
            PlanDecision::Approved => {
                shared.context.lock().unwrap().approved_plan = Some(plan.clone());
                if let Some(manager) = shared.manager.lock().await.as_mut() {
                    manager.set_approved_plan(&plan);
                }
                break;
            }
            PlanDecision::Rejected(text) => feedback = Some(text),
        }
    }

    // --- The iteration loop ---
    let mut iteration: u64 = 1;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if shared.stopping() {
            shared.finalize_stopped();
            return;
        }

        // Injected instructions apply exactly once, at the iteration top.
        {
            let mut context = shared.context.lock().unwrap();
            let drained = context.drain_injected();
            if !drained.is_empty() {
                debug!("applied {} injected instruction(s)", drained.len());
            }
            context.last_iteration_start = Some(Utc::now());
        }
        shared.emit(OfficeEvent::IterationStarted { iteration });
        let started_ts = Utc::now();

        // FetchingEvents
        shared.set_phase(ManagerPhase::FetchingEvents);
        let fetch = {
            let mut guard = shared.manager.lock().await;
            let Some(manager) = guard.as_mut() else { return };
            match manager.fetch_events(iteration, &cancel).await {
                Ok(fetch) => fetch,
                Err(ManagerCallError::Cancelled) => return,
                Err(ManagerCallError::Failed(message)) => {
                    shared.fail_fatal(&message);
                    return;
                }
            }
        };
        if fetch.parse_failed {
            // Non-fatal: logged, and the iteration continues with nothing.
            shared.emit(OfficeEvent::ManagerError {
                message: "event fetch returned no parseable JSON; continuing with zero events"
                    .to_string(),
            });
        }
        if let Some(commentary) = &fetch.commentary {
            shared.emit(OfficeEvent::Commentary {
                text: commentary.clone(),
            });
        }

        let events_discovered = fetch.events.len();
        let mut fresh_events = Vec::new();
        let mut duplicate_decisions = Vec::new();
        {
            let mut context = shared.context.lock().unwrap();
            for event in fetch.events {
                if context.mark_event_seen(&event.event_id) {
                    fresh_events.push(event);
                } else {
                    duplicate_decisions.push(SchedulingDecision {
                        ts: Utc::now(),
                        task_id: event.event_id.clone(),
                        task_title: event.title.clone(),
                        action: SchedulingAction::SkippedDuplicate,
                        reason: "event already handled in a previous iteration".to_string(),
                        assigned_assistant_index: None,
                        queue_position_at_time: 0,
                        available_assistants_at_time: 0,
                    });
                }
            }
        }

        let report = if fresh_events.is_empty() {
            shared.emit(OfficeEvent::NoEventsFound { iteration });
            IterationReport {
                iteration,
                started_ts,
                completed_ts: Utc::now(),
                events_discovered,
                tasks_created: 0,
                tasks_succeeded: 0,
                tasks_failed: 0,
                tasks_cancelled: 0,
                detailed_results: Vec::new(),
                narrative_summary: "No events discovered; nothing to schedule.".to_string(),
                recommendations: String::new(),
                scheduling_log: duplicate_decisions,
            }
        } else {
            shared.emit(OfficeEvent::EventsFetched {
                iteration,
                count: fresh_events.len(),
            });

            // Scheduling
            shared.set_phase(ManagerPhase::Scheduling);
            let config = shared.config_snapshot();
            let effective_prompt = shared.context.lock().unwrap().effective_prompt.clone();
            let tasks: Vec<AssistantTask> = fresh_events
                .iter()
                .map(|event| build_task(event, iteration, &effective_prompt))
                .collect();
            for task in &tasks {
                shared.emit(OfficeEvent::TaskCreated {
                    task_id: task.task_id.clone(),
                    title: task.title.clone(),
                    priority: task.priority,
                });
            }

            // Executing
            shared.set_phase(ManagerPhase::Executing);
            let settings = PoolSettings::from_config(&config);
            let outcome = shared.pool.execute_batch(tasks, &settings, &cancel).await;
            if cancel.is_cancelled() {
                return;
            }

            // Aggregating — runs even when the pool succeeded at nothing.
            shared.set_phase(ManagerPhase::Aggregating);
            shared.emit(OfficeEvent::AggregationStarted { iteration });
            let learnings_snapshot = shared.context.lock().unwrap().learnings.clone();
            let aggregation = {
                let mut guard = shared.manager.lock().await;
                let Some(manager) = guard.as_mut() else { return };
                match manager
                    .aggregate(iteration, &outcome.results, &learnings_snapshot, &cancel)
                    .await
                {
                    Ok(aggregation) => aggregation,
                    Err(ManagerCallError::Cancelled) => return,
                    Err(ManagerCallError::Failed(message)) => {
                        shared.fail_fatal(&message);
                        return;
                    }
                }
            };
            shared
                .context
                .lock()
                .unwrap()
                .add_learnings(&aggregation.learnings);

            let mut scheduling_log = duplicate_decisions;
            scheduling_log.extend(outcome.decisions.clone());
            IterationReport {
                iteration,
                started_ts,
                completed_ts: Utc::now(),
                events_discovered,
                tasks_created: outcome.tasks.len(),
                tasks_succeeded: outcome.succeeded(),
                tasks_failed: outcome.failed(),
                tasks_cancelled: outcome.cancelled(),
                detailed_results: outcome.results,
                narrative_summary: aggregation.narrative_summary,
                recommendations: aggregation.recommendations,
                scheduling_log,
            }
        };

        debug_assert!(report.terminal_counts_consistent());
        shared.emit(OfficeEvent::ReportGenerated { iteration });
        shared.emit(OfficeEvent::IterationCompleted {
            report: Box::new(report.clone()),
        });

        // Knowledge brief: roll in the summary, then ask the manager for a
        // fresh executive compression. A failed compression is non-fatal.
        let iteration_learnings: Vec<String> = shared.context.lock().unwrap().learnings.clone();
        shared
            .brief
            .absorb_iteration(report.narrative_summary.clone(), &iteration_learnings);
        if report.tasks_created > 0 {
            let compressed = {
                let mut guard = shared.manager.lock().await;
                match guard.as_mut() {
                    Some(manager) => manager.compress_brief(iteration, &cancel).await,
                    None => return,
                }
            };
            match compressed {
                Ok(text) => shared.brief.set_executive(&text),
                Err(ManagerCallError::Cancelled) => return,
                Err(ManagerCallError::Failed(message)) => {
                    warn!("brief compression failed ({}); keeping local summary", message);
                }
            }
        }
        let executive = shared.brief.executive_summary();
        {
            let mut context = shared.context.lock().unwrap();
            context.previous_iteration_summary = if executive.is_empty() {
                Some(report.narrative_summary.clone())
            } else {
                Some(executive.clone())
            };
            context.completed_iterations = iteration;
        }
        if let Some(manager) = shared.manager.lock().await.as_mut() {
            if executive.is_empty() {
                manager.set_previous_summary(&report.narrative_summary);
            } else {
                manager.set_previous_summary(&executive);
            }
        }
        shared.history.lock().unwrap().push(report);

        if shared.stopping() {
            // Stop drains the iteration and skips Resting.
            shared.finalize_stopped();
            return;
        }

        // Resting
        shared.set_phase(ManagerPhase::Resting);
        let config = shared.config_snapshot();
        let rest = shared
            .pending_pause
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| config.interval());
        {
            let mut context = shared.context.lock().unwrap();
            context.next_iteration_due =
                Some(Utc::now() + chrono::Duration::seconds(rest.as_secs() as i64));
        }
        shared.emit(OfficeEvent::RestStarted {
            duration_secs: rest.as_secs(),
        });
        let outcome = shared.scheduler.wait_for_next(rest, &cancel, &shared.bus).await;
        shared.emit(OfficeEvent::RestCompleted {
            reason: outcome.reason().to_string(),
        });
        if outcome == WaitOutcome::Aborted {
            return;
        }
        if shared.stopping() {
            shared.finalize_stopped();
            return;
        }
        iteration += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_question_heuristic() {
        assert!(is_meta_question("what's the status?"));
        assert!(is_meta_question("How far along are we?"));
        assert!(is_meta_question("what is the ETA"));
        // Instructions that merely mention a keyword are not meta.
        assert!(!is_meta_question("monitor the status page for outages"));
        assert!(!is_meta_question("add progress logging to the probes"));
        // Questions without a status keyword go to the manager.
        assert!(!is_meta_question("should we widen the scope?"));
    }

    #[test]
    fn clarity_dialog_concatenates_in_order() {
        let mut dialog = ClarityDialog::new("Monitor the repos too");
        dialog.answers.push("platform org".to_string());
        dialog.answers.push("new PRs".to_string());
        assert_eq!(
            dialog.concatenation(),
            "Monitor the repos too; platform org; new PRs"
        );
    }

    #[test]
    fn task_built_from_event_carries_context() {
        let event = DiscoveredEvent {
            event_id: "E9".into(),
            title: "Triage INC-9".into(),
            description: "Sev2 in the payments queue".into(),
            priority: 9,
            category: "incident".into(),
            metadata: serde_json::json!({"queue": "payments"}),
        };
        let task = build_task(&event, 4, "keep the queue healthy");
        assert_eq!(task.title, "Triage INC-9");
        assert_eq!(task.priority, 5); // clamped into 1..=5
        assert_eq!(task.source_event_id, "E9");
        assert_eq!(task.category, "incident");
        assert_eq!(task.iteration, 4);
        assert_eq!(task.metadata["queue"], "payments");
        assert!(task.prompt.contains("Sev2 in the payments queue"));
        assert!(task.prompt.contains("keep the queue healthy"));
    }
}
