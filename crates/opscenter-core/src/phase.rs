//! The manager phase machine.
//!
//! Eleven phases, forward-driven by the orchestrator's driver task.
//! `stop` and `reset` are modeled by their target phases: Stopped is
//! reachable from any active phase after a drain, Idle from anywhere.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerPhase {
    Idle,
    Clarifying,
    Planning,
    AwaitingApproval,
    FetchingEvents,
    Scheduling,
    Executing,
    Aggregating,
    Resting,
    Error,
    Stopped,
}

impl std::fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Clarifying => write!(f, "clarifying"),
            Self::Planning => write!(f, "planning"),
            Self::AwaitingApproval => write!(f, "awaiting approval"),
            Self::FetchingEvents => write!(f, "fetching events"),
            Self::Scheduling => write!(f, "scheduling"),
            Self::Executing => write!(f, "executing"),
            Self::Aggregating => write!(f, "aggregating"),
            Self::Resting => write!(f, "resting"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl ManagerPhase {
    /// Phases that belong to an active iteration.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::FetchingEvents
                | Self::Scheduling
                | Self::Executing
                | Self::Aggregating
                | Self::Resting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether a user instruction may be injected in this phase.
    pub fn accepts_injection(self) -> bool {
        !matches!(self, Self::Idle | Self::Error | Self::Stopped)
    }

    /// Whether the manager session is idle, i.e. a clarity evaluation may
    /// use it without colliding with the driver's own LLM calls.
    pub fn manager_session_idle(self) -> bool {
        matches!(self, Self::Executing | Self::Resting)
    }

    /// Legality of a phase transition.
    pub fn can_transition(self, to: ManagerPhase) -> bool {
        use ManagerPhase::*;
        match (self, to) {
            // Hard reset and fatal error are reachable from anywhere.
            (_, Idle) => true,
            (_, Error) => true,
            (Idle, Clarifying) => true,
            (Clarifying, Clarifying) => true,
            (Clarifying, Planning) => true,
            (Planning, AwaitingApproval) => true,
            (AwaitingApproval, FetchingEvents) => true,
            (AwaitingApproval, Planning) => true,
            (FetchingEvents, Scheduling) => true,
            (FetchingEvents, Resting) => true,
            (Scheduling, Executing) => true,
            (Executing, Aggregating) => true,
            (Aggregating, Resting) => true,
            (Resting, FetchingEvents) => true,
            (from, Stopped) => !matches!(from, Idle | Stopped | Error),
            _ => false,
        }
    }
}
