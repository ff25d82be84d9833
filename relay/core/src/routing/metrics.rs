//! Relay Metrics
//!
//! Lock-free counters for the relay loop:
//! - Requests by final outcome
//! - Attempts and failures by classification
//! - Channel disables and cooldowns
//! - Attempt latency (time to upstream response headers)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::channel::ChannelId;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket boundaries in milliseconds
    buckets: Vec<u64>,
    /// Count per bucket, plus one overflow bucket
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries
    pub fn new(mut buckets: Vec<u64>) -> Self {
        buckets.sort_unstable();
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (ms)
    pub fn latency_default() -> Self {
        Self::new(vec![10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000, 60000])
    }

    /// Record a duration
    pub fn record(&self, elapsed: Duration) {
        let value = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len());

        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Get histogram snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub max: u64,
}

impl HistogramSnapshot {
    /// Mean in milliseconds
    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum as f64 / self.total as f64
        }
    }

    /// Upper bound of the bucket containing percentile `p`
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets.get(i).copied().unwrap_or(self.max);
            }
        }
        self.max
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Relay Metrics
// ============================================================================

/// Per-channel counters
#[derive(Debug, Default)]
struct ChannelCounters {
    attempts: Counter,
    successes: Counter,
    failures: Counter,
}

/// Metrics for the relay orchestrator
#[derive(Debug)]
pub struct RelayMetrics {
    requests_total: Counter,
    requests_succeeded: Counter,
    requests_exhausted: Counter,
    quota_rejections: Counter,
    attempts_total: Counter,
    retries_total: Counter,
    upstream_server_errors: Counter,
    upstream_rate_limited: Counter,
    upstream_client_errors: Counter,
    transport_faults: Counter,
    no_channel: Counter,
    bad_requests: Counter,
    internal_errors: Counter,
    channels_disabled: Counter,
    cooldowns_started: Counter,
    attempt_latency: Histogram,
    per_channel: DashMap<ChannelId, ChannelCounters>,
}

/// Failure categories recorded per attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    UpstreamServerError,
    UpstreamRateLimited,
    UpstreamClientError,
    TransportFault,
    NoAvailableChannel,
    BadRequest,
    Internal,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::new(),
            requests_succeeded: Counter::new(),
            requests_exhausted: Counter::new(),
            quota_rejections: Counter::new(),
            attempts_total: Counter::new(),
            retries_total: Counter::new(),
            upstream_server_errors: Counter::new(),
            upstream_rate_limited: Counter::new(),
            upstream_client_errors: Counter::new(),
            transport_faults: Counter::new(),
            no_channel: Counter::new(),
            bad_requests: Counter::new(),
            internal_errors: Counter::new(),
            channels_disabled: Counter::new(),
            cooldowns_started: Counter::new(),
            attempt_latency: Histogram::latency_default(),
            per_channel: DashMap::new(),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.inc();
    }

    pub fn record_quota_rejection(&self) {
        self.quota_rejections.inc();
    }

    /// Record an attempt against a channel; `retry` is true after the first
    pub fn record_attempt(&self, channel_id: ChannelId, retry: bool) {
        self.attempts_total.inc();
        if retry {
            self.retries_total.inc();
        }
        self.per_channel.entry(channel_id).or_default().attempts.inc();
    }

    pub fn record_attempt_latency(&self, elapsed: Duration) {
        self.attempt_latency.record(elapsed);
    }

    pub fn record_success(&self, channel_id: ChannelId) {
        self.requests_succeeded.inc();
        self.per_channel.entry(channel_id).or_default().successes.inc();
    }

    pub fn record_failure(&self, channel_id: Option<ChannelId>, kind: FailureKind) {
        match kind {
            FailureKind::UpstreamServerError => self.upstream_server_errors.inc(),
            FailureKind::UpstreamRateLimited => self.upstream_rate_limited.inc(),
            FailureKind::UpstreamClientError => self.upstream_client_errors.inc(),
            FailureKind::TransportFault => self.transport_faults.inc(),
            FailureKind::NoAvailableChannel => self.no_channel.inc(),
            FailureKind::BadRequest => self.bad_requests.inc(),
            FailureKind::Internal => self.internal_errors.inc(),
        }
        if let Some(id) = channel_id {
            self.per_channel.entry(id).or_default().failures.inc();
        }
    }

    pub fn record_exhausted(&self) {
        self.requests_exhausted.inc();
    }

    pub fn record_disable(&self) {
        self.channels_disabled.inc();
    }

    pub fn record_cooldown(&self) {
        self.cooldowns_started.inc();
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        let mut channels: Vec<ChannelMetricsSnapshot> = self
            .per_channel
            .iter()
            .map(|e| ChannelMetricsSnapshot {
                channel_id: *e.key(),
                attempts: e.attempts.get(),
                successes: e.successes.get(),
                failures: e.failures.get(),
            })
            .collect();
        channels.sort_by_key(|c| c.channel_id);

        RelayMetricsSnapshot {
            requests_total: self.requests_total.get(),
            requests_succeeded: self.requests_succeeded.get(),
            requests_exhausted: self.requests_exhausted.get(),
            quota_rejections: self.quota_rejections.get(),
            attempts_total: self.attempts_total.get(),
            retries_total: self.retries_total.get(),
            upstream_server_errors: self.upstream_server_errors.get(),
            upstream_rate_limited: self.upstream_rate_limited.get(),
            upstream_client_errors: self.upstream_client_errors.get(),
            transport_faults: self.transport_faults.get(),
            no_channel: self.no_channel.get(),
            bad_requests: self.bad_requests.get(),
            internal_errors: self.internal_errors.get(),
            channels_disabled: self.channels_disabled.get(),
            cooldowns_started: self.cooldowns_started.get(),
            attempt_latency: self.attempt_latency.snapshot(),
            channels,
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-channel snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMetricsSnapshot {
    pub channel_id: ChannelId,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Snapshot of relay metrics
#[derive(Clone, Debug)]
pub struct RelayMetricsSnapshot {
    pub requests_total: u64,
    pub requests_succeeded: u64,
    pub requests_exhausted: u64,
    pub quota_rejections: u64,
    pub attempts_total: u64,
    pub retries_total: u64,
    pub upstream_server_errors: u64,
    pub upstream_rate_limited: u64,
    pub upstream_client_errors: u64,
    pub transport_faults: u64,
    pub no_channel: u64,
    pub bad_requests: u64,
    pub internal_errors: u64,
    pub channels_disabled: u64,
    pub cooldowns_started: u64,
    pub attempt_latency: HistogramSnapshot,
    pub channels: Vec<ChannelMetricsSnapshot>,
}

impl RelayMetricsSnapshot {
    /// Fraction of finished requests that succeeded
    pub fn success_rate(&self) -> f64 {
        let finished = self.requests_succeeded + self.requests_exhausted;
        if finished == 0 {
            1.0
        } else {
            self.requests_succeeded as f64 / finished as f64
        }
    }
}
