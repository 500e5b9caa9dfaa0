//! Scripted gateway — deterministic sessions for tests.
//!
//! Replies are scripted per session-id prefix ("manager", "assistant", …);
//! each `send` pops the next reply from the matching queue. The gateway
//! also keeps live-session accounting so tests can assert the concurrency
//! cap directly.

use crate::gateway::{
    GatewayError, GatewayResult, SessionEvent, SessionGateway, SessionHandle, SessionSpec,
    SessionStream,
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub enum ScriptedReply {
    /// Stream the text in small chunks, then Idle.
    Text(String),
    /// Tool start/end pairs before the text, then Idle.
    TextWithTools { text: String, tools: Vec<String> },
    /// Yield an error item instead of Idle.
    StreamError(String),
    /// Sleep before answering; drives timeout and cancellation paths.
    DelayedText { delay: Duration, text: String },
    /// Never answers; unblocks only via timeout or cancellation.
    Hang,
}

#[derive(Clone, Default)]
pub struct ScriptedGateway {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    scripts: DashMap<String, VecDeque<ScriptedReply>>,
    prompts: DashMap<String, Vec<String>>,
    created: Mutex<Vec<String>>,
    terminated: Mutex<Vec<String>>,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    failing_creates: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for sessions whose id starts with `prefix`. The longest
    /// matching prefix wins at create time.
    pub fn script(&self, prefix: impl Into<String>, replies: Vec<ScriptedReply>) {
        self.inner.scripts.insert(prefix.into(), replies.into());
    }

    pub fn push_reply(&self, prefix: &str, reply: ScriptedReply) {
        self.inner
            .scripts
            .entry(prefix.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Make the next `n` create calls fail with a transient error.
    pub fn fail_next_creates(&self, n: usize) {
        self.inner.failing_creates.store(n, Ordering::SeqCst);
    }

    pub fn created_sessions(&self) -> Vec<String> {
        self.inner.created.lock().unwrap().clone()
    }

    pub fn terminated_sessions(&self) -> Vec<String> {
        self.inner.terminated.lock().unwrap().clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrently live sessions.
    pub fn peak_live_sessions(&self) -> usize {
        self.inner.peak_live.load(Ordering::SeqCst)
    }

    /// Prompts sent on a given session, in order.
    pub fn prompts_for(&self, session_id: &str) -> Vec<String> {
        self.inner
            .prompts
            .get(session_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl Inner {
    fn next_reply(&self, key: &str) -> ScriptedReply {
        if let Some(mut queue) = self.scripts.get_mut(key) {
            if let Some(reply) = queue.pop_front() {
                return reply;
            }
        }
        ScriptedReply::Text("ok".to_string())
    }

    fn script_key_for(&self, session_id: &str) -> String {
        self.scripts
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| session_id.starts_with(k.as_str()))
            .max_by_key(|k| k.len())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SessionGateway for ScriptedGateway {
    async fn create(&self, spec: SessionSpec) -> GatewayResult<Arc<dyn SessionHandle>> {
        let failing = self.inner.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_creates.store(failing - 1, Ordering::SeqCst);
            return Err(GatewayError::RequestFailed(
                "scripted create failure".into(),
            ));
        }

        self.inner
            .created
            .lock()
            .unwrap()
            .push(spec.session_id.clone());
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_live.fetch_max(live, Ordering::SeqCst);

        Ok(Arc::new(ScriptedSession {
            inner: self.inner.clone(),
            script_key: self.inner.script_key_for(&spec.session_id),
            session_id: spec.session_id,
            abort: Mutex::new(CancellationToken::new()),
            terminated: AtomicBool::new(false),
        }))
    }
}

pub struct ScriptedSession {
    inner: Arc<Inner>,
    script_key: String,
    session_id: String,
    abort: Mutex<CancellationToken>,
    terminated: AtomicBool,
}

/// Chunk text the way a streaming backend would.
fn text_chunks(text: &str) -> Vec<String> {
    text.as_bytes()
        .chunks(20)
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect()
}

#[async_trait::async_trait]
impl SessionHandle for ScriptedSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(
        &self,
        prompt: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> GatewayResult<SessionStream> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(GatewayError::Terminated);
        }
        self.inner
            .prompts
            .entry(self.session_id.clone())
            .or_default()
            .push(prompt.to_string());

        let reply = self.inner.next_reply(&self.script_key);
        let abort = CancellationToken::new();
        *self.abort.lock().unwrap() = abort.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        let stream = async_stream::stream! {
            match reply {
                ScriptedReply::Text(text) => {
                    for chunk in text_chunks(&text) {
                        yield Ok(SessionEvent::TextDelta(chunk));
                    }
                    yield Ok(SessionEvent::Idle);
                }
                ScriptedReply::TextWithTools { text, tools } => {
                    for name in tools {
                        let id = format!(
                            "tool_{}",
                            &uuid::Uuid::new_v4().simple().to_string()[..8]
                        );
                        yield Ok(SessionEvent::ToolStart { id: id.clone(), name: name.clone() });
                        yield Ok(SessionEvent::ToolEnd { id, name });
                    }
                    for chunk in text_chunks(&text) {
                        yield Ok(SessionEvent::TextDelta(chunk));
                    }
                    yield Ok(SessionEvent::Idle);
                }
                ScriptedReply::StreamError(message) => {
                    yield Err(GatewayError::Stream(message));
                }
                ScriptedReply::DelayedText { delay, text } => {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
                        _ = abort.cancelled() => Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => Err(GatewayError::Timeout(timeout)),
                        _ = tokio::time::sleep(delay) => Ok(()),
                    };
                    match outcome {
                        Ok(()) => {
                            for chunk in text_chunks(&text) {
                                yield Ok(SessionEvent::TextDelta(chunk));
                            }
                            yield Ok(SessionEvent::Idle);
                        }
                        Err(e) => yield Err(e),
                    }
                }
                ScriptedReply::Hang => {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => GatewayError::Cancelled,
                        _ = abort.cancelled() => GatewayError::Cancelled,
                        _ = tokio::time::sleep_until(deadline) => GatewayError::Timeout(timeout),
                    };
                    yield Err(outcome);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn abort(&self) {
        self.abort.lock().unwrap().cancel();
    }

    async fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.abort.lock().unwrap().cancel();
            self.inner.live.fetch_sub(1, Ordering::SeqCst);
            self.inner
                .terminated
                .lock()
                .unwrap()
                .push(self.session_id.clone());
        }
    }
}
