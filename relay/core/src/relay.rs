//! Relay Orchestrator
//!
//! Drives one inbound request through reservation, provider resolution,
//! forwarding and settlement.
//!
//! # State Machine
//!
//! ```text
//!  Start ──(model header)──► Reserving ──(reserve ok)──► Attempting(0)
//!    │                           │                            │
//!    │ missing header            │ quota refused              │ resolve ─► cooldown ─► forward
//!    ▼                           ▼                            │
//!  BadRequest               QuotaExhausted         ┌──────────┼──────────────────┐
//!                                                  │ success  │ retryable        │ fatal / budget spent
//!                                                  ▼          ▼                  ▼
//!                                             Succeeded   Attempting(n+1)    Exhausted
//!                                             (consume)                      (undo)
//! ```
//!
//! Attempts within one request are strictly sequential and never sleep.
//! The reservation is owned by the state; every exit path settles it, and a
//! dropped future releases it through the guard.

use std::sync::Arc;
use std::time::Instant;

use http::header::HeaderName;
use http::StatusCode;

use crate::channel::ChannelId;
use crate::error::{RelayError, SelectError};
use crate::forward::{
    InboundRequest, ProxyForwarder, DEFAULT_BYTES_PER_UNIT, DEFAULT_MODEL_HEADER,
    DEFAULT_ROUTE_PREFIX,
};
use crate::provider::{ProviderFactory, UpstreamResponse};
use crate::quota::{QuotaLedger, Reservation, Settlement, Usage};
use crate::routing::health::ChannelHealthTracker;
use crate::routing::metrics::RelayMetrics;
use crate::routing::retry::{FailureClass, RetryPolicy};
use crate::routing::selector::{ChannelRegistry, ModelAliases, ProviderSelector, SelectionContext};

// ============================================================================
// Settings
// ============================================================================

/// Orchestrator settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelaySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Quota held while attempts run
    pub reserve_estimate: i64,
    /// Gateway path prefix stripped before forwarding
    pub route_prefix: String,
    /// Header naming the requested model
    pub model_header: String,
    /// Bytes per usage unit
    pub bytes_per_unit: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            reserve_estimate: 1,
            route_prefix: DEFAULT_ROUTE_PREFIX.to_string(),
            model_header: DEFAULT_MODEL_HEADER.to_string(),
            bytes_per_unit: DEFAULT_BYTES_PER_UNIT,
        }
    }
}

impl RelaySettings {
    /// Parsed model header name
    pub fn model_header_name(&self) -> Result<HeaderName, RelayError> {
        HeaderName::from_bytes(self.model_header.trim().as_bytes()).map_err(|e| {
            RelayError::Internal(format!("invalid model header {:?}: {e}", self.model_header))
        })
    }

    /// Route prefix with trailing slashes removed
    ///
    /// Empty means the gateway serves every path. Otherwise the prefix must
    /// be an absolute path without route pattern characters.
    pub fn normalized_route_prefix(&self) -> Result<String, RelayError> {
        let prefix = self.route_prefix.trim().trim_end_matches('/');
        if prefix.is_empty() {
            return Ok(String::new());
        }
        if !prefix.starts_with('/') || prefix.contains(['{', '}', '*']) {
            return Err(RelayError::Internal(format!(
                "invalid route prefix {:?}: must start with '/' and contain no '{{', '}}' or '*'",
                self.route_prefix
            )));
        }
        Ok(prefix.to_string())
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// A successfully relayed request
#[derive(Debug)]
pub struct RelayOutcome {
    /// Upstream response to stream back verbatim
    pub response: UpstreamResponse,
    /// Channel that served the request
    pub channel_id: ChannelId,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Model name used for dispatch and billing
    pub resolved_model: String,
    /// Estimated usage
    pub usage: Usage,
    /// Quota settlement
    pub settlement: Settlement,
}

/// Orchestrator states
enum RelayState {
    Attempting {
        attempt: u32,
        reservation: Reservation,
    },
    Succeeded(RelayOutcome),
    Exhausted {
        attempts: u32,
        reservation: Reservation,
    },
}

/// Last failure kept for the final error
struct LastFailure {
    class: FailureClass,
    message: String,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Relay orchestrator
///
/// Shared by every in-flight request; holds no per-request state.
pub struct RelayOrchestrator {
    selector: ProviderSelector,
    forwarder: ProxyForwarder,
    ledger: Arc<QuotaLedger>,
    health: Arc<ChannelHealthTracker>,
    metrics: Arc<RelayMetrics>,
    policy: RetryPolicy,
    reserve_estimate: i64,
}

impl RelayOrchestrator {
    /// Build an orchestrator
    ///
    /// Channels configured as disabled start disabled in `health`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Internal`] when the model header name or route prefix
    /// is invalid.
    pub fn new(
        settings: &RelaySettings,
        registry: Arc<dyn ChannelRegistry>,
        aliases: ModelAliases,
        factory: Arc<dyn ProviderFactory>,
        ledger: Arc<QuotaLedger>,
        health: Arc<ChannelHealthTracker>,
    ) -> Result<Self, RelayError> {
        let route_prefix = settings.normalized_route_prefix()?;
        let model_header = settings.model_header_name()?;

        for channel in registry.all() {
            if !channel.enabled {
                health.disable(channel.id);
            }
        }

        let forwarder = ProxyForwarder::new(
            route_prefix,
            model_header,
            settings.bytes_per_unit,
        );
        let selector = ProviderSelector::new(registry, Arc::clone(&health), aliases, factory);

        Ok(Self {
            selector,
            forwarder,
            ledger,
            health,
            metrics: Arc::new(RelayMetrics::new()),
            policy: RetryPolicy {
                max_retries: settings.max_retries,
            },
            reserve_estimate: settings.reserve_estimate,
        })
    }

    /// Relay metrics
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Channel health tracker
    pub fn health(&self) -> &Arc<ChannelHealthTracker> {
        &self.health
    }

    /// Quota ledger
    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// Forwarder in use
    pub fn forwarder(&self) -> &ProxyForwarder {
        &self.forwarder
    }

    /// Attempt budget
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Model named by the inbound model-selector header
    pub fn declared_model(&self, request: &InboundRequest) -> Result<String, RelayError> {
        let header = self.forwarder.model_header();
        request
            .headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RelayError::BadRequest(format!("missing model name header {header}")))
    }

    /// Relay one request on behalf of `caller`
    pub async fn relay(
        &self,
        caller: &str,
        request: InboundRequest,
    ) -> Result<RelayOutcome, RelayError> {
        self.metrics.record_request();

        // Start
        let model = self.declared_model(&request)?;

        // Reserving
        let reservation = self
            .ledger
            .reserve(caller, &model, self.reserve_estimate)
            .map_err(|e| {
                self.metrics.record_quota_rejection();
                tracing::info!(caller, model = %model, error = %e, "Quota reservation refused");
                RelayError::QuotaExhausted(e)
            })?;

        let mut ctx = SelectionContext::new();
        let mut last: Option<LastFailure> = None;
        let mut state = RelayState::Attempting {
            attempt: 0,
            reservation,
        };

        loop {
            state = match state {
                RelayState::Attempting {
                    attempt,
                    reservation,
                } => {
                    self.attempt(&request, &model, attempt, reservation, &mut ctx, &mut last)
                        .await
                }
                RelayState::Succeeded(outcome) => {
                    self.metrics.record_success(outcome.channel_id);
                    tracing::info!(
                        caller,
                        model = %model,
                        resolved_model = %outcome.resolved_model,
                        channel_id = outcome.channel_id,
                        attempts = outcome.attempts,
                        charged = outcome.settlement.charged,
                        status = outcome.response.status.as_u16(),
                        "Relay succeeded"
                    );
                    return Ok(outcome);
                }
                RelayState::Exhausted {
                    attempts,
                    reservation,
                } => {
                    reservation.undo();
                    self.metrics.record_exhausted();
                    let err = exhausted_error(attempts, last.take());
                    tracing::warn!(
                        caller,
                        model = %model,
                        attempts,
                        status = err.status().as_u16(),
                        error = %err,
                        "Relay exhausted"
                    );
                    return Err(err);
                }
            };
        }
    }

    /// One pass of `Attempting(attempt)`
    async fn attempt(
        &self,
        request: &InboundRequest,
        model: &str,
        attempt: u32,
        mut reservation: Reservation,
        ctx: &mut SelectionContext,
        last: &mut Option<LastFailure>,
    ) -> RelayState {
        let attempts = attempt + 1;
        let next = |reservation: Reservation| {
            if self.policy.has_attempt_after(attempt) {
                RelayState::Attempting {
                    attempt: attempt + 1,
                    reservation,
                }
            } else {
                RelayState::Exhausted {
                    attempts,
                    reservation,
                }
            }
        };

        let resolved = match self.selector.resolve(model, ctx) {
            Ok(resolved) => resolved,
            Err(err) => {
                if let SelectError::Provider { channel_id, .. } = &err {
                    ctx.mark_tried(*channel_id);
                }
                let class = FailureClass::of_select(&err);
                self.metrics.record_failure(None, class.metric_kind());
                tracing::warn!(model, attempt, error = %err, "Provider resolution failed, retrying");
                record_failure(last, class, &err);
                return next(reservation);
            }
        };

        let channel_id = resolved.channel().id;
        ctx.mark_tried(channel_id);
        reservation.set_model(resolved.resolved_model.clone());

        if self.health.cooldown(channel_id) {
            self.metrics.record_cooldown();
        }
        self.metrics.record_attempt(channel_id, attempt > 0);

        let started = Instant::now();
        let result = self
            .forwarder
            .forward(request, resolved.provider.as_ref(), &resolved.resolved_model)
            .await;
        self.metrics.record_attempt_latency(started.elapsed());

        match result {
            Ok(forwarded) => {
                let settlement = reservation.consume(&forwarded.usage);
                RelayState::Succeeded(RelayOutcome {
                    response: forwarded.response,
                    channel_id,
                    attempts,
                    resolved_model: resolved.resolved_model,
                    usage: forwarded.usage,
                    settlement,
                })
            }
            Err(err) => {
                let class = FailureClass::of_forward(&err);
                let decision = class.decision();
                self.metrics.record_failure(Some(channel_id), class.metric_kind());

                if decision.disable_channel && self.health.disable(channel_id) {
                    self.metrics.record_disable();
                }

                tracing::warn!(
                    channel_id,
                    channel = %resolved.channel().name,
                    model = %resolved.resolved_model,
                    attempt,
                    remaining = self.policy.max_retries.saturating_sub(attempt),
                    disabled = decision.disable_channel,
                    retry = decision.retry,
                    error = %err,
                    "Relay attempt failed"
                );
                record_failure(last, class, &err);

                if decision.retry {
                    next(reservation)
                } else {
                    RelayState::Exhausted {
                        attempts,
                        reservation,
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RelayOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayOrchestrator")
            .field("forwarder", &self.forwarder)
            .field("policy", &self.policy)
            .field("reserve_estimate", &self.reserve_estimate)
            .finish_non_exhaustive()
    }
}

/// Keep the most informative failure: a resolution miss never hides an
/// earlier upstream error.
fn record_failure(last: &mut Option<LastFailure>, class: FailureClass, err: &dyn std::fmt::Display) {
    let keep_previous = class == FailureClass::NoAvailableChannel
        && last
            .as_ref()
            .is_some_and(|prev| prev.class != FailureClass::NoAvailableChannel);
    if !keep_previous {
        *last = Some(LastFailure {
            class,
            message: err.to_string(),
        });
    }
}

fn exhausted_error(attempts: u32, last: Option<LastFailure>) -> RelayError {
    match last {
        Some(LastFailure {
            class: FailureClass::BadRequest,
            message,
        }) => RelayError::Exhausted {
            attempts,
            status: StatusCode::BAD_REQUEST,
            message,
        },
        Some(LastFailure { message, .. }) => RelayError::Exhausted {
            attempts,
            status: StatusCode::BAD_GATEWAY,
            message,
        },
        None => RelayError::Exhausted {
            attempts,
            status: StatusCode::BAD_GATEWAY,
            message: "no available channel".to_string(),
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
