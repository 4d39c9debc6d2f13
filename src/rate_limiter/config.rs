//! # Token Bucket Configuration
//!
//! Two numbers describe a bucket:
//!
//! ```text
//!     ┌──────────────────────────────┐
//!     │   capacity (burst)           │ ← most requests admitted back-to-back
//!     │   ┌─────────────────────┐    │
//!     │   │ ● ● ● ● ● ● ● ●     │    │ ← current tokens
//!     │   └─────────────────────┘    │
//!     │                              │
//!     │   refill_rate: 10.0 / sec    │ ← continuous, not stepped
//!     └──────────────────────────────┘
//! ```
//!
//! Refill is continuous: after `t` seconds idle a bucket holds
//! `min(capacity, tokens + t * refill_rate)` tokens. Internally tokens are
//! fixed-point with six fractional digits so fractional refill is not lost
//! between calls.

use crate::error::ConfigError;

/// Fixed-point scale: one whole token is this many micro-tokens.
pub(crate) const MICROS_PER_TOKEN: u64 = 1_000_000;

/// Configuration for a single token bucket.
///
/// # Examples
///
/// ```rust
/// use tasker::BucketConfig;
///
/// // 10 requests per second sustained, bursts of up to 20
/// let config = BucketConfig::new(20, 10.0);
/// assert!(config.validate().is_ok());
///
/// // Burst equal to the rate
/// let config = BucketConfig::per_second(50.0);
/// assert_eq!(config.capacity, 50);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum number of tokens the bucket can hold (burst size).
    pub capacity: u64,

    /// Tokens added per second. Zero means the bucket never refills.
    pub refill_rate: f64,
}

impl Default for BucketConfig {
    /// 10 tokens per second with a burst of 20.
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_rate: 10.0,
        }
    }
}

impl BucketConfig {
    /// Creates a configuration with an explicit burst and rate.
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Creates a configuration whose burst equals its per-second rate.
    ///
    /// Fractional rates round the burst up so at least one token fits.
    pub fn per_second(rate: f64) -> Self {
        Self {
            capacity: rate.ceil().max(1.0) as u64,
            refill_rate: rate,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// - `capacity` is 0, or too large to be represented in micro-tokens
    /// - `refill_rate` is negative, NaN or infinite
    ///
    /// ```rust
    /// use tasker::BucketConfig;
    ///
    /// assert!(BucketConfig::new(0, 10.0).validate().is_err());
    /// assert!(BucketConfig::new(10, f64::NAN).validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be greater than 0"));
        }
        if self.capacity > u64::MAX / MICROS_PER_TOKEN {
            return Err(ConfigError::invalid("capacity", "exceeds the fixed-point range"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(ConfigError::invalid(
                "refill_rate",
                "must be a finite, non-negative number",
            ));
        }
        Ok(())
    }

    /// Capacity expressed in micro-tokens.
    #[inline]
    pub(crate) fn capacity_micros(&self) -> u64 {
        self.capacity.saturating_mul(MICROS_PER_TOKEN)
    }
}
