//! Error types for opscenter

use crate::phase::ManagerPhase;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: ManagerPhase, to: ManagerPhase },

    #[error("{op} is not valid while {phase}")]
    ControlRejected {
        op: &'static str,
        phase: ManagerPhase,
    },

    #[error("manager session error: {0}")]
    ManagerSession(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn control_rejected(op: &'static str, phase: ManagerPhase) -> Self {
        Self::ControlRejected { op, phase }
    }

    pub fn manager_session(message: impl Into<String>) -> Self {
        Self::ManagerSession(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }
}
