//! Dispatch workers: the read → handle → ack loop of a consumed channel.
//!
//! One [`DispatchWorker`] runs per consumed channel. Acknowledgment follows
//! the session's [`AckMode`](crate::session::AckMode): whole-batch sessions
//! are acknowledged only when every event settled, per-event sessions get the
//! settled subset. A [`RedeliveryPolicy`] decides when a repeatedly failing
//! event is moved to a dead-letter channel instead of being retried.

mod policy;
mod stats;
mod worker;

pub use policy::{
    policy_from_config, DeadLetterPolicy, RedeliveryDecision, RedeliveryPolicy,
    UnboundedRedelivery,
};
pub use stats::{WorkerState, WorkerStats, WorkerStatsSnapshot};
pub use worker::{CycleReport, CycleStatus, DispatchWorker, WorkerConfig};
