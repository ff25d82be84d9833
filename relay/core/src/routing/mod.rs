//! Routing
//!
//! Everything that decides where an attempt goes and what happens after it
//! fails:
//!
//! - [`selector`] - model aliasing, availability filtering, priority groups
//!   and weighted random choice
//! - [`health`] - per-channel cooldown windows and sticky disabling
//! - [`retry`] - failure classification and the attempt budget
//! - [`metrics`] - relay counters and attempt latency

pub mod health;
pub mod metrics;
pub mod retry;
pub mod selector;

pub use health::{ChannelHealth, ChannelHealthTracker, HealthConfig, HealthSnapshot};
pub use metrics::{FailureKind, RelayMetrics, RelayMetricsSnapshot};
pub use retry::{FailureClass, RetryDecision, RetryPolicy};
pub use selector::{
    ChannelRegistry, ModelAliases, ProviderSelector, Resolved, SelectionContext,
    StaticChannelRegistry,
};
