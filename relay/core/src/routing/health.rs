//! Channel Health Tracking
//!
//! Process-wide health side-state for upstream channels:
//! - **Cooldown**: a time-boxed, self-clearing unavailability window
//! - **Disable**: a sticky unavailability flag cleared only by an operator
//!
//! ```text
//!               cooldown(id)                 window elapses
//! Available --------------------> Cooling ---------------------> Available
//!     |                              |
//!     | disable(id)                  | disable(id)
//!     v                              v
//! Disabled <-------------------------+        (enable(id) is the only exit)
//! ```
//!
//! # Thread Safety
//!
//! Entries live in a `DashMap` keyed by channel id and are created lazily on
//! first reference. Each entry owns its own lock for the cooldown deadline
//! and an atomic disabled flag, so updates to one channel never contend with
//! another. Entries are never removed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::channel::ChannelId;

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for health tracking behavior
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Length of the cooldown window. Zero disables cooldowns entirely.
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Channel Health
// ============================================================================

/// Health state for a single channel
pub struct ChannelHealth {
    /// Channel identifier
    pub channel_id: ChannelId,

    /// End of the current cooldown window, if any
    cooldown_until: Mutex<Option<Instant>>,

    /// Sticky disabled flag
    disabled: AtomicBool,

    /// Number of cooldown windows started
    cooldowns: AtomicU64,
}

impl ChannelHealth {
    /// Create a fresh, available entry
    #[must_use]
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            cooldown_until: Mutex::new(None),
            disabled: AtomicBool::new(false),
            cooldowns: AtomicU64::new(0),
        }
    }

    /// Start a cooldown window of `window` from now.
    ///
    /// Returns `false` when a window is already active (it is not extended)
    /// or when `window` is zero.
    pub fn cooldown(&self, window: Duration) -> bool {
        if window.is_zero() {
            return false;
        }

        let now = Instant::now();
        let mut until = self.cooldown_until.lock();
        if until.is_some_and(|deadline| deadline > now) {
            return false;
        }
        *until = Some(now + window);
        self.cooldowns.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Mark disabled until an operator re-enables the channel
    ///
    /// Returns `true` if the channel was not already disabled.
    pub fn disable(&self) -> bool {
        !self.disabled.swap(true, Ordering::AcqRel)
    }

    /// Clear the disabled flag and any cooldown
    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
        *self.cooldown_until.lock() = None;
    }

    /// Whether the channel is disabled
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Remaining cooldown, `None` when not cooling
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = *self.cooldown_until.lock();
        until.and_then(|deadline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            (!remaining.is_zero()).then_some(remaining)
        })
    }

    /// True iff not disabled and not inside an active cooldown window
    pub fn is_available(&self) -> bool {
        !self.is_disabled() && self.cooldown_remaining().is_none()
    }

    /// Get a snapshot of the current health state
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            channel_id: self.channel_id,
            disabled: self.is_disabled(),
            cooldown_remaining: self.cooldown_remaining(),
            cooldowns_started: self.cooldowns.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ChannelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHealth")
            .field("channel_id", &self.channel_id)
            .field("disabled", &self.is_disabled())
            .field("cooldown_remaining", &self.cooldown_remaining())
            .finish()
    }
}

/// Immutable snapshot of a channel's health
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Channel identifier
    pub channel_id: ChannelId,
    /// Whether the channel is disabled
    pub disabled: bool,
    /// Remaining cooldown window
    pub cooldown_remaining: Option<Duration>,
    /// Cooldown windows started since process start
    pub cooldowns_started: u64,
}

impl HealthSnapshot {
    /// Whether the channel would be selected right now
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.disabled && self.cooldown_remaining.is_none()
    }
}

// ============================================================================
// Health Tracker
// ============================================================================

/// Health tracker shared by every in-flight request
///
/// Injected by reference into the selector and the orchestrator; there is no
/// global instance.
pub struct ChannelHealthTracker {
    /// Per-channel health state
    channels: DashMap<ChannelId, Arc<ChannelHealth>>,

    /// Tracker configuration
    config: HealthConfig,
}

impl ChannelHealthTracker {
    /// Create a new health tracker
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    /// Create with custom configuration
    #[must_use]
    pub fn with_config(config: HealthConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
        }
    }

    /// Configured cooldown window
    pub fn cooldown_window(&self) -> Duration {
        self.config.cooldown
    }

    /// Get or lazily create the entry for a channel
    pub fn entry(&self, channel_id: ChannelId) -> Arc<ChannelHealth> {
        if let Some(health) = self.channels.get(&channel_id) {
            return Arc::clone(health.value());
        }
        self.channels
            .entry(channel_id)
            .or_insert_with(|| Arc::new(ChannelHealth::new(channel_id)))
            .clone()
    }

    /// Mark the channel temporarily unusable for the configured window
    pub fn cooldown(&self, channel_id: ChannelId) -> bool {
        let started = self.entry(channel_id).cooldown(self.config.cooldown);
        if started {
            tracing::debug!(
                channel_id,
                window_ms = self.config.cooldown.as_millis() as u64,
                "Channel cooling down"
            );
        }
        started
    }

    /// Mark the channel unusable until [`enable`](Self::enable) is called
    pub fn disable(&self, channel_id: ChannelId) -> bool {
        let newly = self.entry(channel_id).disable();
        if newly {
            tracing::warn!(channel_id, "Channel disabled");
        }
        newly
    }

    /// Operator reset: clear disabled and cooldown state
    pub fn enable(&self, channel_id: ChannelId) {
        self.entry(channel_id).enable();
        tracing::info!(channel_id, "Channel re-enabled");
    }

    /// True iff not disabled and not within an active cooldown window
    ///
    /// Does not create an entry; an unknown channel is available.
    pub fn is_available(&self, channel_id: ChannelId) -> bool {
        self.channels
            .get(&channel_id)
            .map_or(true, |h| h.is_available())
    }

    /// Whether the channel is disabled
    pub fn is_disabled(&self, channel_id: ChannelId) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|h| h.is_disabled())
    }

    /// Snapshot for a specific channel
    pub fn snapshot(&self, channel_id: ChannelId) -> Option<HealthSnapshot> {
        self.channels.get(&channel_id).map(|h| h.snapshot())
    }

    /// Snapshots for all tracked channels, ordered by id
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<_> = self.channels.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by_key(|s| s.channel_id);
        snapshots
    }

    /// Ids of all disabled channels
    pub fn disabled_channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self
            .channels
            .iter()
            .filter(|e| e.value().is_disabled())
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of tracked channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ChannelHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
