//! # Bucket Metrics
//!
//! Point-in-time snapshots of a token bucket's counters, with a few derived
//! ratios and a coarse health classification.
//!
//! ```text
//!     ┌─────────────────────────────────────┐
//!     │  Success Rate: 85%                  │
//!     │  Token Usage:  70%                  │
//!     │  Health:       Healthy              │
//!     └─────────────────────────────────────┘
//! ```

use std::fmt;

/// Snapshot of a [`TokenBucket`](crate::TokenBucket)'s counters.
///
/// ```rust
/// use tasker::{BucketConfig, HealthStatus, TokenBucket};
///
/// let bucket = TokenBucket::new(BucketConfig::new(2, 1.0));
/// bucket.try_acquire();
/// bucket.try_acquire();
/// bucket.try_acquire();
///
/// let metrics = bucket.metrics();
/// assert_eq!(metrics.total_requests(), 3);
/// assert_eq!(metrics.health_status(), HealthStatus::Critical);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BucketMetrics {
    /// Requests admitted.
    pub total_acquired: u64,

    /// Requests rejected.
    pub total_rejected: u64,

    /// Whole tokens in the bucket when the snapshot was taken.
    pub current_tokens: u64,

    /// Burst capacity.
    pub capacity: u64,

    /// Rejections since the last admitted request.
    pub consecutive_rejections: u32,
}

impl BucketMetrics {
    /// Fraction of requests admitted, `1.0` when nothing has been seen yet.
    #[inline]
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            1.0
        } else {
            self.total_acquired as f64 / total as f64
        }
    }

    /// Fraction of requests rejected.
    #[inline]
    pub fn rejection_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    /// How much of the burst is currently spent, from `0.0` (full) to `1.0` (empty).
    #[inline]
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            1.0 - (self.current_tokens as f64 / self.capacity as f64)
        }
    }

    /// Admitted plus rejected.
    #[inline]
    pub fn total_requests(&self) -> u64 {
        self.total_acquired + self.total_rejected
    }

    /// The bucket is empty or is rejecting most requests.
    #[inline]
    pub fn is_under_pressure(&self) -> bool {
        self.success_rate() < 0.5 || self.current_tokens == 0
    }

    /// More than 10 rejections in a row, or more than 30% rejected overall.
    #[inline]
    pub fn is_under_sustained_pressure(&self) -> bool {
        self.consecutive_rejections > 10 || self.rejection_rate() > 0.3
    }

    /// Classifies the bucket from its counters.
    pub fn health_status(&self) -> HealthStatus {
        if self.is_under_sustained_pressure() {
            HealthStatus::Critical
        } else if self.is_under_pressure() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Multi-line human-readable report.
    pub fn summary(&self) -> String {
        format!(
            "TokenBucket Metrics:\n\
             ├─ Tokens: {}/{} ({:.2}% used)\n\
             ├─ Admitted: {} ({:.2}%)\n\
             ├─ Rejected: {} (streak {})\n\
             └─ Health: {}",
            self.current_tokens,
            self.capacity,
            self.utilization() * 100.0,
            self.total_acquired,
            self.success_rate() * 100.0,
            self.total_rejected,
            self.consecutive_rejections,
            self.health_status(),
        )
    }
}

impl fmt::Display for BucketMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Three-level health indicator derived from [`BucketMetrics`].
///
/// ```text
///     Healthy ──► plenty of headroom
///     Degraded ─► empty or mostly rejecting right now
///     Critical ─► rejecting persistently
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Under short-term pressure.
    Degraded,
    /// Under sustained pressure.
    Critical,
}

impl HealthStatus {
    /// Returns `true` unless the status is `Critical`.
    #[inline]
    pub fn is_operational(&self) -> bool {
        !matches!(self, Self::Critical)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "Healthy",
            Self::Degraded => "Degraded",
            Self::Critical => "Critical",
        };
        f.write_str(label)
    }
}
