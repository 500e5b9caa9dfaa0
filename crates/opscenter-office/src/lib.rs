//! The operations office: orchestrator state machine, interval scheduler,
//! event log and stream, manager context, and the knowledge brief store.

pub mod brief;
pub mod context;
pub mod log;
pub mod orchestrator;
pub mod scheduler;
pub mod stream;

pub use brief::{BriefStore, KnowledgeBrief};
pub use context::{ClarificationExchange, ManagerContext};
pub use log::{EventLog, LogEntry};
pub use orchestrator::{InjectionOutcome, Office, OfficeSnapshot};
pub use scheduler::{IntervalScheduler, WaitOutcome};
pub use stream::{spawn_event_pump, EventHub, EventSubscription};
