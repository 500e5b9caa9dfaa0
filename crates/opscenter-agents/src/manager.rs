//! The manager role: prompt templates and parse rules against one
//! long-lived session.
//!
//! A lost session is recreated up to twice, replaying the approved plan,
//! the previous iteration summary and the clarification history before the
//! failed prompt is retried. Exhausted reconnects surface as a failed call;
//! the orchestrator turns that into the Error phase.

use crate::parse::{self, ClarityVerdict, DiscoveredEvent};
use opscenter_core::{AssistantResult, OfficeConfig};
use opscenter_gateway::{
    drain_reply, with_backoff, GatewayError, SessionGateway, SessionHandle, SessionReply,
    SessionSpec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ManagerCallError {
    #[error("cancelled")]
    Cancelled,

    #[error("manager session failed: {0}")]
    Failed(String),
}

pub type ManagerResult<T> = Result<T, ManagerCallError>;

#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub model: String,
    pub working_directory: std::path::PathBuf,
    pub enabled_tools: Vec<String>,
    pub llm_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &OfficeConfig) -> Self {
        Self {
            model: config.manager_model.clone(),
            working_directory: config.working_directory.clone(),
            enabled_tools: config.enabled_tool_providers.clone(),
            llm_timeout: config.manager_llm_timeout(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ClarifyOutcome {
    Ready,
    Question(String),
}

#[derive(Clone, Debug, Default)]
pub struct FetchOutcome {
    pub events: Vec<DiscoveredEvent>,
    pub commentary: Option<String>,
    /// Both parse attempts failed; the iteration proceeds with zero events.
    pub parse_failed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Aggregation {
    pub narrative_summary: String,
    pub recommendations: String,
    pub learnings: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum Clarity {
    Clear,
    Clarify(String),
}

pub struct ManagerAgent {
    gateway: Arc<dyn SessionGateway>,
    settings: ManagerSettings,
    system_prompt: String,
    handle: Arc<dyn SessionHandle>,
    session_seq: u32,
    pending_question: Option<String>,
    approved_plan: Option<String>,
    previous_summary: Option<String>,
    clarification_history: Vec<(String, String)>,
}

impl ManagerAgent {
    pub async fn connect(
        gateway: Arc<dyn SessionGateway>,
        settings: ManagerSettings,
        system_prompt: String,
    ) -> ManagerResult<Self> {
        let spec = session_spec("manager", &settings, &system_prompt);
        let handle = with_backoff("create manager session", || gateway.create(spec.clone()))
            .await
            .map_err(into_call_error)?;
        info!("manager session connected: model={}", settings.model);
        Ok(Self {
            gateway,
            settings,
            system_prompt,
            handle,
            session_seq: 0,
            pending_question: None,
            approved_plan: None,
            previous_summary: None,
            clarification_history: Vec::new(),
        })
    }

    pub fn set_approved_plan(&mut self, plan: impl Into<String>) {
        self.approved_plan = Some(plan.into());
    }

    pub fn set_previous_summary(&mut self, summary: impl Into<String>) {
        self.previous_summary = Some(summary.into());
    }

    pub fn clarification_history(&self) -> &[(String, String)] {
        &self.clarification_history
    }

    /// BEGIN CLARIFICATION for a fresh objective.
    pub async fn clarify_objective(
        &mut self,
        objective: &str,
        cancel: &CancellationToken,
    ) -> ManagerResult<ClarifyOutcome> {
        let prompt = format!(
            "User objective: {objective}. BEGIN CLARIFICATION. \
             Ask questions needed to fully understand the objective. \
             If none, respond exactly: READY_TO_PLAN."
        );
        let reply = self.roundtrip(&prompt, cancel).await?;
        Ok(self.classify_clarification(reply.text))
    }

    /// Feed a user's answer back into the clarification dialog.
    pub async fn answer_clarification(
        &mut self,
        answer: &str,
        cancel: &CancellationToken,
    ) -> ManagerResult<ClarifyOutcome> {
        if let Some(question) = self.pending_question.take() {
            self.clarification_history
                .push((question, answer.to_string()));
        }
        let reply = self.roundtrip(answer, cancel).await?;
        Ok(self.classify_clarification(reply.text))
    }

    fn classify_clarification(&mut self, text: String) -> ClarifyOutcome {
        if parse::contains_ready_signal(&text) {
            ClarifyOutcome::Ready
        } else {
            let question = text.trim().to_string();
            self.pending_question = Some(question.clone());
            ClarifyOutcome::Question(question)
        }
    }

    /// CREATE EXECUTION PLAN; rejection feedback is appended on re-issue.
    pub async fn create_plan(
        &mut self,
        feedback: Option<&str>,
        cancel: &CancellationToken,
    ) -> ManagerResult<String> {
        let mut prompt = "CREATE EXECUTION PLAN. Describe step-by-step how each \
                          iteration will work using your tools and the user objective."
            .to_string();
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n\nThe user rejected the previous plan with this feedback: {feedback}"
            ));
        }
        let reply = self.roundtrip(&prompt, cancel).await?;
        Ok(reply.text.trim().to_string())
    }

    /// CHECK FOR EVENTS: balanced-brace JSON extraction with one clarifying
    /// retry; a second failure degrades to zero events, never an error.
    pub async fn fetch_events(
        &mut self,
        iteration: u64,
        cancel: &CancellationToken,
    ) -> ManagerResult<FetchOutcome> {
        let prompt = format!(
            "CHECK FOR EVENTS. Iteration #{iteration}. Use your tools to query for work. \
             Respond in this JSON shape: {{\"events_found\": bool, \"events\": \
             [{{\"event_id\": str, \"title\": str, \"description\": str, \
             \"priority\": 1..5, \"category\": str, \"metadata\": object}}], \
             \"commentary\": str}}"
        );
        let reply = self.roundtrip(&prompt, cancel).await?;
        if let Some(parsed) = parse::parse_fetch_reply(&reply.text) {
            return Ok(FetchOutcome {
                events: parsed.events,
                commentary: parsed.commentary,
                parse_failed: false,
            });
        }

        debug!("event fetch parse failed, retrying with clarification");
        let reply = self
            .roundtrip("Return ONLY the JSON object described above.", cancel)
            .await?;
        if let Some(parsed) = parse::parse_fetch_reply(&reply.text) {
            return Ok(FetchOutcome {
                events: parsed.events,
                commentary: parsed.commentary,
                parse_failed: false,
            });
        }

        warn!("event fetch parse failed twice; proceeding with zero events");
        Ok(FetchOutcome {
            events: Vec::new(),
            commentary: None,
            parse_failed: true,
        })
    }

    /// AGGREGATE RESULTS into a Markdown report plus LEARNING lines.
    pub async fn aggregate(
        &mut self,
        iteration: u64,
        results: &[AssistantResult],
        learnings: &[String],
        cancel: &CancellationToken,
    ) -> ManagerResult<Aggregation> {
        let serialized =
            serde_json::to_string_pretty(results).unwrap_or_else(|_| "[]".to_string());
        let prompt = format!(
            "AGGREGATE RESULTS for Iteration #{iteration}. Here are the assistant \
             results: {serialized}. Previous learnings: {learnings:?}. Produce a \
             Markdown report with per-task summary, statistics, recommendations, \
             and any new learnings on a line beginning `LEARNING:`."
        );
        let reply = self.roundtrip(&prompt, cancel).await?;
        let (narrative, new_learnings) = parse::split_learnings(&reply.text);
        let recommendations =
            parse::extract_section(&reply.text, "recommendations").unwrap_or_default();
        let fresh: Vec<String> = new_learnings
            .into_iter()
            .filter(|l| !learnings.contains(l))
            .collect();
        Ok(Aggregation {
            narrative_summary: narrative,
            recommendations,
            learnings: fresh,
        })
    }

    /// Compress the iteration into the knowledge brief's executive summary.
    pub async fn compress_brief(
        &mut self,
        iteration: u64,
        cancel: &CancellationToken,
    ) -> ManagerResult<String> {
        let prompt = format!(
            "UPDATE KNOWLEDGE BRIEF after Iteration #{iteration}. Produce a compressed \
             brief: a short executive summary of everything so far, and a bullet list \
             of open questions under a `## Open Questions` heading."
        );
        let reply = self.roundtrip(&prompt, cancel).await?;
        Ok(reply.text.trim().to_string())
    }

    /// Clarity evaluation for a mid-run instruction. Safe only while the
    /// manager session is otherwise idle; the orchestrator gates that.
    pub async fn evaluate_clarity(
        &mut self,
        instruction: &str,
        cancel: &CancellationToken,
    ) -> ManagerResult<Clarity> {
        let prompt = format!(
            "USER INSTRUCTION: {instruction}. Respond CLEAR if actionable as-is, \
             else respond CLARIFY: {{question}}."
        );
        let reply = self.roundtrip(&prompt, cancel).await?;
        Ok(match parse::parse_clarity(&reply.text) {
            ClarityVerdict::Clear => Clarity::Clear,
            ClarityVerdict::Clarify(question) => Clarity::Clarify(question),
        })
    }

    pub async fn terminate(&self) {
        self.handle.terminate().await;
    }

    async fn roundtrip(
        &mut self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> ManagerResult<SessionReply> {
        match self.try_send(prompt, cancel).await {
            Ok(reply) => Ok(reply),
            Err(GatewayError::Cancelled) => Err(ManagerCallError::Cancelled),
            Err(e) => {
                warn!("manager call failed: {} — reconnecting", e);
                self.reconnect_and_retry(prompt, cancel).await
            }
        }
    }

    async fn try_send(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionReply, GatewayError> {
        with_backoff("manager send", || async {
            let stream = self
                .handle
                .send(prompt, self.settings.llm_timeout, cancel.clone())
                .await?;
            drain_reply(stream, |_| {}).await
        })
        .await
    }

    /// Recreate the session and replay context, then retry the prompt.
    async fn reconnect_and_retry(
        &mut self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> ManagerResult<SessionReply> {
        for attempt in 1..=RECONNECT_ATTEMPTS {
            self.session_seq += 1;
            let session_id = format!("manager-r{}", self.session_seq);
            info!(
                "reconnecting manager session ({}/{}) as {}",
                attempt, RECONNECT_ATTEMPTS, session_id
            );
            let spec = session_spec(&session_id, &self.settings, &self.system_prompt);
            let handle =
                match with_backoff("recreate manager session", || self.gateway.create(spec.clone()))
                    .await
                {
                    Ok(handle) => handle,
                    Err(GatewayError::Cancelled) => return Err(ManagerCallError::Cancelled),
                    Err(e) => {
                        warn!("manager reconnect {} failed: {}", attempt, e);
                        continue;
                    }
                };

            let old = std::mem::replace(&mut self.handle, handle);
            old.terminate().await;

            let replay = self.replay_context();
            if !replay.is_empty() {
                match self.try_send(&replay, cancel).await {
                    Ok(_) => {}
                    Err(GatewayError::Cancelled) => return Err(ManagerCallError::Cancelled),
                    Err(e) => {
                        warn!("manager replay failed on attempt {}: {}", attempt, e);
                        continue;
                    }
                }
            }

            match self.try_send(prompt, cancel).await {
                Ok(reply) => return Ok(reply),
                Err(GatewayError::Cancelled) => return Err(ManagerCallError::Cancelled),
                Err(e) => warn!("manager retry failed on attempt {}: {}", attempt, e),
            }
        }
        Err(ManagerCallError::Failed(
            "manager session lost after reconnect attempts".to_string(),
        ))
    }

    /// Context replayed into a fresh session: approved plan, previous
    /// summary, clarification history — the conservative set.
    fn replay_context(&self) -> String {
        let mut sections = Vec::new();
        if !self.clarification_history.is_empty() {
            let qa = self
                .clarification_history
                .iter()
                .map(|(q, a)| format!("Q: {}\nA: {}", q, a))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Clarifications so far:\n{}", qa));
        }
        if let Some(plan) = &self.approved_plan {
            sections.push(format!("Approved execution plan:\n{}", plan));
        }
        if let Some(summary) = &self.previous_summary {
            sections.push(format!("Previous iteration summary:\n{}", summary));
        }
        if sections.is_empty() {
            return String::new();
        }
        format!(
            "SESSION RESTORED after a connection loss. Context to date:\n\n{}\n\n\
             Acknowledge briefly and wait for the next instruction.",
            sections.join("\n\n")
        )
    }
}

/// Answer a follow-up question against the knowledge brief only: a fresh
/// short-lived session seeded with the brief, never the full transcript.
pub async fn answer_follow_up(
    gateway: &Arc<dyn SessionGateway>,
    settings: &ManagerSettings,
    brief: &str,
    question: &str,
    cancel: &CancellationToken,
) -> ManagerResult<String> {
    let session_id = format!("followup-{}", opscenter_core::new_task_id());
    let system_prompt = format!(
        "You answer follow-up questions about a completed operations run. \
         Use ONLY the knowledge brief below; say so when it does not cover \
         the question.\n\n{brief}"
    );
    let spec = session_spec(&session_id, settings, &system_prompt);
    let handle = with_backoff("create follow-up session", || gateway.create(spec.clone()))
        .await
        .map_err(into_call_error)?;

    let sent = async {
        let stream = handle
            .send(question, settings.llm_timeout, cancel.clone())
            .await?;
        drain_reply(stream, |_| {}).await
    }
    .await;
    handle.terminate().await;

    match sent {
        Ok(reply) => Ok(reply.text.trim().to_string()),
        Err(GatewayError::Cancelled) => Err(ManagerCallError::Cancelled),
        Err(e) => Err(ManagerCallError::Failed(e.to_string())),
    }
}

fn session_spec(session_id: &str, settings: &ManagerSettings, system_prompt: &str) -> SessionSpec {
    SessionSpec::new(session_id, &settings.model)
        .with_working_directory(settings.working_directory.clone())
        .with_system_prompt(system_prompt)
        .with_tools(settings.enabled_tools.clone())
}

fn into_call_error(e: GatewayError) -> ManagerCallError {
    match e {
        GatewayError::Cancelled => ManagerCallError::Cancelled,
        other => ManagerCallError::Failed(other.to_string()),
    }
}
