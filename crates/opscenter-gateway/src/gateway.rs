//! The session gateway contract.
//!
//! A session is a named conversation with an LLM backend. `send` yields a
//! finite stream of typed events terminated by exactly one `Idle` (an error
//! item may replace it); the caller drains the stream to completion or
//! aborts. The gateway serializes calls per handle — callers never issue
//! concurrent sends on one handle.

use futures::{Stream, StreamExt};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("session terminated")]
    Terminated,

    #[error("fatal gateway error: {0}")]
    Fatal(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl GatewayError {
    /// Transient errors are retried locally with backoff; everything else
    /// propagates to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed(_)
                | Self::RateLimited { .. }
                | Self::Stream(_)
                | Self::Network(_)
        )
    }
}

/// Events yielded by a session stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    TextDelta(String),
    Reasoning(String),
    ToolStart { id: String, name: String },
    ToolEnd { id: String, name: String },
    /// Terminates every successful stream, exactly once.
    Idle,
}

pub type SessionStream = Pin<Box<dyn Stream<Item = GatewayResult<SessionEvent>> + Send>>;

/// Everything needed to open a session.
#[derive(Clone, Debug)]
pub struct SessionSpec {
    pub session_id: String,
    pub model: String,
    pub working_directory: PathBuf,
    pub system_prompt: Option<String>,
    pub enabled_tools: Vec<String>,
}

impl SessionSpec {
    pub fn new(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            model: model.into(),
            working_directory: PathBuf::from("."),
            system_prompt: None,
            enabled_tools: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.enabled_tools = tools;
        self
    }
}

#[async_trait::async_trait]
pub trait SessionGateway: Send + Sync {
    /// Open a session. Transient failures may be retried by the caller;
    /// fatal ones propagate.
    async fn create(&self, spec: SessionSpec) -> GatewayResult<Arc<dyn SessionHandle>>;
}

#[async_trait::async_trait]
pub trait SessionHandle: Send + Sync {
    fn session_id(&self) -> &str;

    /// Stream a reply. The stream ends with exactly one `Idle` unless an
    /// error item replaces it. Cancellation is honored within 500 ms.
    async fn send(
        &self,
        prompt: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> GatewayResult<SessionStream>;

    /// Cancel an in-flight send; guaranteed to unblock the stream.
    async fn abort(&self);

    /// Release all session resources; idempotent.
    async fn terminate(&self);
}

/// A drained session reply.
#[derive(Clone, Debug, Default)]
pub struct SessionReply {
    pub text: String,
    pub reasoning: String,
    /// Names of completed tool invocations, in order.
    pub actions: Vec<String>,
}

/// Drain a session stream to completion. `on_text` observes each text delta
/// (for progress reporting). Returns on `Idle`; an error item aborts the
/// drain and propagates.
pub async fn drain_reply<F>(mut stream: SessionStream, mut on_text: F) -> GatewayResult<SessionReply>
where
    F: FnMut(&str),
{
    let mut reply = SessionReply::default();
    while let Some(item) = stream.next().await {
        match item? {
            SessionEvent::TextDelta(text) => {
                on_text(&text);
                reply.text.push_str(&text);
            }
            SessionEvent::Reasoning(text) => reply.reasoning.push_str(&text),
            SessionEvent::ToolStart { .. } => {}
            SessionEvent::ToolEnd { name, .. } => reply.actions.push(name),
            SessionEvent::Idle => return Ok(reply),
        }
    }
    Err(GatewayError::Stream(
        "stream ended without idle".to_string(),
    ))
}

/// Scoped terminate: dropping the guard spawns a best-effort `terminate`
/// unless the handle was taken back with [`TerminateOnDrop::disarm`].
/// This is what guarantees release on every exit path, including panics.
pub struct TerminateOnDrop {
    handle: Option<Arc<dyn SessionHandle>>,
}

impl TerminateOnDrop {
    pub fn new(handle: Arc<dyn SessionHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> &Arc<dyn SessionHandle> {
        self.handle.as_ref().expect("guard not yet dropped")
    }

    /// Take the handle back for an orderly terminate.
    pub fn disarm(mut self) -> Arc<dyn SessionHandle> {
        self.handle.take().expect("guard not yet dropped")
    }
}

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    handle.terminate().await;
                });
            }
        }
    }
}
