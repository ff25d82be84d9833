//! Relay error types
//!
//! `ForwardError` describes how a single attempt failed; it carries facts
//! only (status, transport fault). Deciding what a failure means for the
//! channel and the retry loop happens in [`crate::routing::retry`].
//! `RelayError` is what the orchestrator hands back to the serving layer.

use http::StatusCode;
use thiserror::Error;

use crate::channel::ChannelId;
use crate::quota::QuotaError;

/// Failure of one forward attempt
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// Upstream answered with a non-success status
    #[error("upstream returned {status}: {message}")]
    Upstream {
        /// Upstream status
        status: StatusCode,
        /// Body excerpt or reason phrase
        message: String,
    },

    /// Connect, send or header timeout failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The inbound request cannot be forwarded as given
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Gateway-side misconfiguration
    #[error("internal error: {0}")]
    Internal(String),
}

impl ForwardError {
    /// Upstream status when the upstream answered
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ForwardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::Internal(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Provider resolution failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    /// No enabled, healthy channel serves the model
    #[error("no available channel for model {model}")]
    NoAvailableChannel {
        /// Model that was requested (after aliasing)
        model: String,
    },

    /// The picked channel could not be turned into a provider
    #[error("channel {channel_id} unusable: {message}")]
    Provider {
        /// Channel that failed to build
        channel_id: ChannelId,
        /// Build failure
        message: String,
    },
}

/// Final failure of a relayed request
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Missing model header, malformed or untransformable body
    #[error("{0}")]
    BadRequest(String),

    /// Reservation refused
    #[error("request quota exhausted")]
    QuotaExhausted(#[source] QuotaError),

    /// All attempts failed
    #[error("{message}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Status reported to the caller
        status: StatusCode,
        /// Message of the last recorded failure
        message: String,
    },

    /// Gateway fault outside the attempt loop
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::QuotaExhausted(_) => StatusCode::FORBIDDEN,
            Self::Exhausted { status, .. } => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind used in the JSON body
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::QuotaExhausted(_) => "quota_exhausted",
            Self::Exhausted { status, .. } if *status == StatusCode::BAD_REQUEST => "bad_request",
            Self::Exhausted { .. } => "relay_exhausted",
            Self::Internal(_) => "internal_error",
        }
    }
}
