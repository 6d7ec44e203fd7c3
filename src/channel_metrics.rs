//! # Subscription backlog metrics
//!
//! Subscriptions buffer without bound so the notification pump never blocks
//! and nothing is dropped. The monitor counts what was routed to a
//! subscription and what its consumer has taken, and warns when a slow
//! consumer lets the backlog grow past the configured threshold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Subscription health status
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelHealthStatus {
    /// Backlog below 80% of the warning threshold
    Healthy,
    /// Backlog between 80% and 100% of the warning threshold
    Degraded { saturation_percent: f64 },
    /// Backlog at or beyond the warning threshold
    Critical { saturation_percent: f64 },
}

impl ChannelHealthStatus {
    /// Create health status from saturation (backlog / threshold)
    pub fn from_saturation(saturation: f64) -> Self {
        if saturation >= 1.0 {
            Self::Critical {
                saturation_percent: saturation * 100.0,
            }
        } else if saturation >= 0.80 {
            Self::Degraded {
                saturation_percent: saturation * 100.0,
            }
        } else {
            Self::Healthy
        }
    }

    /// Check if status indicates a problem
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get saturation percentage if available
    pub fn saturation_percent(&self) -> Option<f64> {
        match self {
            Self::Healthy => None,
            Self::Degraded { saturation_percent } | Self::Critical { saturation_percent } => {
                Some(*saturation_percent)
            }
        }
    }
}

/// Point-in-time counters of one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMetrics {
    /// Messages routed into the subscription buffer
    pub messages_routed: u64,
    /// Messages taken by the consumer
    pub messages_consumed: u64,
    /// Messages currently buffered
    pub backlog: u64,
    pub health_status: ChannelHealthStatus,
}

/// Backlog monitor shared between the pump (producer side) and the
/// subscription handle (consumer side)
#[derive(Debug, Clone)]
pub struct SubscriptionMonitor {
    channel: String,
    warning_threshold: u64,
    messages_routed: Arc<AtomicU64>,
    messages_consumed: Arc<AtomicU64>,
}

impl SubscriptionMonitor {
    pub fn new(channel: impl Into<String>, warning_threshold: usize) -> Self {
        Self {
            channel: channel.into(),
            warning_threshold: warning_threshold.max(1) as u64,
            messages_routed: Arc::new(AtomicU64::new(0)),
            messages_consumed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a message placed into the buffer
    ///
    /// Warns each time the backlog reaches another multiple of the threshold,
    /// so a stuck consumer is reported without flooding the log.
    pub fn record_routed(&self) {
        let routed = self.messages_routed.fetch_add(1, Ordering::Relaxed) + 1;

        if routed % 10_000 == 0 {
            debug!(
                channel = %self.channel,
                total_routed = routed,
                "Subscription throughput milestone"
            );
        }

        let backlog = routed.saturating_sub(self.messages_consumed.load(Ordering::Relaxed));
        if backlog >= self.warning_threshold && backlog % self.warning_threshold == 0 {
            warn!(
                channel = %self.channel,
                backlog,
                warning_threshold = self.warning_threshold,
                "Subscription backlog growing - consumer is not keeping up"
            );
        }
    }

    /// Record a message taken by the consumer
    pub fn record_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages currently buffered
    pub fn backlog(&self) -> u64 {
        let consumed = self.messages_consumed.load(Ordering::Relaxed);
        self.messages_routed
            .load(Ordering::Relaxed)
            .saturating_sub(consumed)
    }

    /// Backlog as a fraction of the warning threshold
    pub fn saturation(&self) -> f64 {
        self.backlog() as f64 / self.warning_threshold as f64
    }

    pub fn check_health(&self) -> ChannelHealthStatus {
        ChannelHealthStatus::from_saturation(self.saturation())
    }

    pub fn metrics(&self) -> SubscriptionMetrics {
        SubscriptionMetrics {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            backlog: self.backlog(),
            health_status: self.check_health(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn warning_threshold(&self) -> u64 {
        self.warning_threshold
    }
}
