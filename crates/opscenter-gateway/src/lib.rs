//! Session gateway: the only door between the office and an LLM backend.
//!
//! The core consumes the [`SessionGateway`] / [`SessionHandle`] traits;
//! [`AnthropicGateway`] is the production implementation and
//! [`ScriptedGateway`] the deterministic one used by tests.

pub mod anthropic;
pub mod gateway;
pub mod mock;
pub mod retry;

pub use anthropic::AnthropicGateway;
pub use gateway::{
    drain_reply, GatewayError, GatewayResult, SessionEvent, SessionGateway, SessionHandle,
    SessionReply, SessionSpec, SessionStream, TerminateOnDrop,
};
pub use mock::{ScriptedGateway, ScriptedReply};
pub use retry::with_backoff;
