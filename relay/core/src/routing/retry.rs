//! Failure Classification and Retry Policy
//!
//! The one place that decides what a failed attempt means:
//!
//! ```text
//! failure                       channel     loop
//! ----------------------------  ----------  -----------
//! upstream 5xx                  disable     retry
//! upstream 429                  disable     retry
//! upstream other status         -           stop
//! transport fault / timeout     -           retry
//! no available channel          -           retry
//! internal (misconfiguration)   disable     retry
//! bad request (body, mapping)   -           stop
//! ```
//!
//! 5xx/429 and gateway-side channel faults say the channel is at fault, so
//! another channel may succeed. Other statuses say the request is at fault
//! and would fail again anywhere.

use http::StatusCode;

use crate::error::{ForwardError, SelectError};
use crate::routing::metrics::FailureKind;

/// Classified failure of one attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Upstream 5xx
    UpstreamServerError(StatusCode),
    /// Upstream 429
    UpstreamRateLimited,
    /// Any other non-success upstream status
    UpstreamClientError(StatusCode),
    /// Network or timeout failure
    TransportFault,
    /// Provider resolution failed
    NoAvailableChannel,
    /// Request cannot be forwarded as given
    BadRequest,
    /// Gateway misconfiguration for this channel
    Internal,
}

/// What the orchestrator does after a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    /// Mark the channel disabled
    pub disable_channel: bool,
    /// Try another attempt (subject to the attempt budget)
    pub retry: bool,
}

impl FailureClass {
    /// Classify a forwarder failure
    #[must_use]
    pub fn of_forward(err: &ForwardError) -> Self {
        match err {
            ForwardError::Upstream { status, .. } => Self::of_status(*status),
            ForwardError::Transport(_) => Self::TransportFault,
            ForwardError::BadRequest(_) => Self::BadRequest,
            ForwardError::Internal(_) => Self::Internal,
        }
    }

    /// Classify a selection failure
    #[must_use]
    pub fn of_select(_err: &SelectError) -> Self {
        Self::NoAvailableChannel
    }

    /// Classify an upstream status
    #[must_use]
    pub fn of_status(status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Self::UpstreamRateLimited
        } else if status.is_server_error() {
            Self::UpstreamServerError(status)
        } else {
            Self::UpstreamClientError(status)
        }
    }

    /// Channel and loop consequences of this failure
    #[must_use]
    pub fn decision(&self) -> RetryDecision {
        match self {
            Self::UpstreamServerError(_) | Self::UpstreamRateLimited | Self::Internal => {
                RetryDecision {
                    disable_channel: true,
                    retry: true,
                }
            }
            Self::TransportFault | Self::NoAvailableChannel => RetryDecision {
                disable_channel: false,
                retry: true,
            },
            Self::UpstreamClientError(_) | Self::BadRequest => RetryDecision {
                disable_channel: false,
                retry: false,
            },
        }
    }

    /// Metrics bucket
    #[must_use]
    pub fn metric_kind(&self) -> FailureKind {
        match self {
            Self::UpstreamServerError(_) => FailureKind::UpstreamServerError,
            Self::UpstreamRateLimited => FailureKind::UpstreamRateLimited,
            Self::UpstreamClientError(_) => FailureKind::UpstreamClientError,
            Self::TransportFault => FailureKind::TransportFault,
            Self::NoAvailableChannel => FailureKind::NoAvailableChannel,
            Self::BadRequest => FailureKind::BadRequest,
            Self::Internal => FailureKind::Internal,
        }
    }
}

/// Attempt budget for one request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Total attempts allowed
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt may follow attempt number `attempt` (0-based)
    #[must_use]
    pub fn has_attempt_after(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
