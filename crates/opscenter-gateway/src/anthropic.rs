//! Anthropic-backed session gateway with SSE streaming.
//!
//! Each session keeps its own conversation history so the manager retains
//! continuity across sends. History is committed only when a stream reaches
//! Idle; a failed or aborted send leaves the transcript untouched so the
//! caller can retry the same prompt.

use crate::gateway::{
    GatewayError, GatewayResult, SessionEvent, SessionGateway, SessionHandle, SessionSpec,
    SessionStream,
};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicGateway {
    client: Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicGateway {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            max_tokens: 8192,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait::async_trait]
impl SessionGateway for AnthropicGateway {
    async fn create(&self, spec: SessionSpec) -> GatewayResult<Arc<dyn SessionHandle>> {
        debug!(
            "Anthropic session {} created: model={}",
            spec.session_id, spec.model
        );
        Ok(Arc::new(AnthropicSession {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            max_tokens: self.max_tokens,
            spec,
            history: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
            abort: std::sync::Mutex::new(CancellationToken::new()),
            terminated: AtomicBool::new(false),
        }))
    }
}

pub struct AnthropicSession {
    client: Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    spec: SessionSpec,
    history: Arc<tokio::sync::Mutex<Vec<WireMessage>>>,
    /// Serializes sends on this handle; the permit lives inside the stream.
    in_flight: Arc<tokio::sync::Mutex<()>>,
    abort: std::sync::Mutex<CancellationToken>,
    terminated: AtomicBool,
}

#[derive(Clone, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
}

#[async_trait::async_trait]
impl SessionHandle for AnthropicSession {
    fn session_id(&self) -> &str {
        &self.spec.session_id
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

        let permit = self.in_flight.clone().lock_owned().await;
        let abort = CancellationToken::new();
        *self.abort.lock().unwrap() = abort.clone();

        let mut messages = self.history.lock().await.clone();
        messages.push(WireMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let body = MessagesRequest {
            model: self.spec.model.clone(),
            max_tokens: self.max_tokens,
            stream: true,
            system: self.spec.system_prompt.clone(),
            messages: messages.clone(),
        };

        debug!(
            "Anthropic send: session={} model={} messages={}",
            self.spec.session_id,
            body.model,
            body.messages.len()
        );

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic error {}: {}", status, error_text);
            return Err(match status.as_u16() {
                401 | 403 => GatewayError::AuthFailed(error_text),
                429 => GatewayError::RateLimited {
                    retry_after_ms: 60_000,
                },
                _ => GatewayError::RequestFailed(format!("{}: {}", status, error_text)),
            });
        }

        let history = self.history.clone();
        let prompt_owned = prompt.to_string();
        let bytes_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let _permit = permit;
            let deadline = tokio::time::Instant::now() + timeout;
            let mut buffer = String::new();
            let mut text_acc = String::new();
            let mut current_tool: Option<(String, String)> = None;
            tokio::pin!(bytes_stream);

            'read: loop {
                enum Step {
                    Chunk(Option<Result<bytes::Bytes, reqwest::Error>>),
                    TimedOut,
                    Cancelled,
                }
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = abort.cancelled() => Step::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Step::TimedOut,
                    chunk = bytes_stream.next() => Step::Chunk(chunk),
                };

                let chunk = match step {
                    Step::Cancelled => {
                        yield Err(GatewayError::Cancelled);
                        break 'read;
                    }
                    Step::TimedOut => {
                        yield Err(GatewayError::Timeout(timeout));
                        break 'read;
                    }
                    Step::Chunk(None) => {
                        yield Err(GatewayError::Stream(
                            "connection closed before idle".to_string(),
                        ));
                        break 'read;
                    }
                    Step::Chunk(Some(Err(e))) => {
                        yield Err(GatewayError::Stream(e.to_string()));
                        break 'read;
                    }
                    Step::Chunk(Some(Ok(chunk))) => chunk,
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(event_end) = buffer.find("\n\n") {
                    let event_str = buffer[..event_end].to_string();
                    buffer = buffer[event_end + 2..].to_string();

                    let mut event_type = String::new();
                    let mut event_data = String::new();
                    for line in event_str.lines() {
                        if let Some(rest) = line.strip_prefix("event: ") {
                            event_type = rest.to_string();
                        } else if let Some(rest) = line.strip_prefix("data: ") {
                            event_data = rest.to_string();
                        }
                    }
                    if event_data.is_empty() {
                        continue;
                    }

                    match event_type.as_str() {
                        "content_block_start" => {
                            if let Ok(data) = serde_json::from_str::<ContentBlockStart>(&event_data) {
                                if let ContentBlockType::ToolUse { id, name } = data.content_block {
                                    current_tool = Some((id.clone(), name.clone()));
                                    yield Ok(SessionEvent::ToolStart { id, name });
                                }
                            }
                        }
                        "content_block_delta" => {
                            if let Ok(data) = serde_json::from_str::<ContentBlockDelta>(&event_data) {
                                match data.delta {
                                    DeltaType::TextDelta { text } => {
                                        text_acc.push_str(&text);
                                        yield Ok(SessionEvent::TextDelta(text));
                                    }
                                    DeltaType::ThinkingDelta { thinking } => {
                                        yield Ok(SessionEvent::Reasoning(thinking));
                                    }
                                    DeltaType::InputJsonDelta { .. } => {}
                                }
                            }
                        }
                        "content_block_stop" => {
                            if let Some((id, name)) = current_tool.take() {
                                yield Ok(SessionEvent::ToolEnd { id, name });
                            }
                        }
                        "message_stop" => {
                            // Commit the exchange only on a clean finish.
                            let mut history = history.lock().await;
                            history.push(WireMessage {
                                role: "user".to_string(),
                                content: prompt_owned.clone(),
                            });
                            history.push(WireMessage {
                                role: "assistant".to_string(),
                                content: text_acc.clone(),
                            });
                            drop(history);
                            yield Ok(SessionEvent::Idle);
                            break 'read;
                        }
                        "error" => {
                            if let Ok(data) = serde_json::from_str::<ErrorEvent>(&event_data) {
                                yield Err(GatewayError::Stream(data.error.message));
                            } else {
                                yield Err(GatewayError::Stream(event_data));
                            }
                            break 'read;
                        }
                        _ => {}
                    }
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
            self.history.lock().await.clear();
            debug!("Anthropic session {} terminated", self.spec.session_id);
        }
    }
}

// ---------------------------------------------------------------------------
// SSE wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlockType {
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(rename = "text")]
    Text {},
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaType {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}
