//! Agent roles: the one-shot assistant worker, the bounded assistant pool,
//! and the long-lived manager role with its prompt/parse rules.

pub mod assistant;
pub mod manager;
pub mod parse;
pub mod pool;

pub use assistant::{run_assistant, AssistantSettings};
pub use manager::{
    answer_follow_up, Aggregation, Clarity, ClarifyOutcome, FetchOutcome, ManagerAgent,
    ManagerCallError, ManagerSettings,
};
pub use parse::{DiscoveredEvent, FetchReply};
pub use pool::{AssistantPool, BatchOutcome, PoolGauges, PoolSettings};
