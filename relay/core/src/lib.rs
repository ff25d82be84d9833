//! Relay Core
//!
//! Request orchestration for a multi-tenant API gateway. A caller's request
//! names a model; the core reserves quota, picks an upstream channel, forwards
//! the request verbatim, and on failure classifies the error, updates channel
//! health and retries on another channel within a fixed budget.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────────────────────────────────┐
//! │ HTTP surface│────►│ RelayOrchestrator                            │
//! │ (daemon)    │     │   QuotaLedger ─ reserve / consume / undo     │
//! └─────────────┘     │   ProviderSelector ─ registry + health       │
//!                     │   ProxyForwarder ─ Provider::send            │
//!                     │   FailureClass ─ disable? retry?             │
//!                     └──────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`channel`] - upstream channel records and credentials
//! - [`config`] - TOML, environment and CLI configuration
//! - [`error`] - forwarder, selector and relay errors
//! - [`forward`] - inbound to outbound request translation
//! - [`provider`] - provider trait, HTTP client pool and the general proxy
//! - [`quota`] - quota store, price table and reservations
//! - [`relay`] - the per-request state machine
//! - [`routing`] - selection, health, retry classification and metrics

pub mod channel;
pub mod config;
pub mod error;
pub mod forward;
pub mod provider;
pub mod quota;
pub mod relay;
pub mod routing;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{Channel, ChannelId, ChannelKind, Credential};
pub use config::{load_config, ConfigError, ConfigOverrides, ConfigSource, GatewayConfig};
pub use error::{ForwardError, RelayError, SelectError};
pub use forward::{InboundRequest, ProxyForwarder};
pub use provider::{HttpProviderFactory, Provider, ProviderFactory, UpstreamResponse};
pub use quota::{
    InMemoryQuotaStore, PriceTable, QuotaError, QuotaLedger, QuotaStore, Reservation, Usage,
};
pub use relay::{RelayOrchestrator, RelayOutcome, RelaySettings};
pub use routing::{ChannelHealthTracker, ChannelRegistry, ModelAliases, StaticChannelRegistry};
