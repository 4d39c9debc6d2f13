//! # Token Bucket
//!
//! The bucket is shared by every request thread that maps to it, so the hot
//! path is a compare-and-swap loop over an atomic token counter rather than a
//! mutex.
//!
//! ```text
//!     try_acquire():
//!
//!     now ──► claim elapsed interval ──► credit elapsed × rate
//!                (CAS last_refill)          (capped at capacity)
//!                                                │
//!                                                ▼
//!                         tokens ≥ 1 ? ──Yes──► CAS tokens - 1 ──► admit
//!                              │
//!                              No ──────────────────────────────► reject
//! ```
//!
//! ## Refill accounting
//!
//! Each elapsed interval is credited exactly once: a thread first moves
//! `last_refill` forward with a CAS, and only the winner of that CAS adds the
//! tokens for the interval it claimed. Credit is truncated to whole
//! micro-tokens, so a bucket can under-credit by a rounding error but never
//! over-admit. Over any window the number of admissions stays at or below
//! `capacity + floor(elapsed * refill_rate)`.

use super::{
    config::{BucketConfig, MICROS_PER_TOKEN},
    metrics::BucketMetrics,
    utils::{current_time_ms, current_time_us},
};
use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Maximum number of CAS attempts before a contended acquire gives up.
///
/// Giving up rejects the request; it never admits one without a token.
const MAX_CAS_RETRIES: usize = 16;

/// Minimum interval between `last_access_ms` updates (milliseconds).
///
/// Idle eviction works at second granularity, so writing the timestamp on
/// every request would only add contention.
const LAST_ACCESS_UPDATE_INTERVAL_MS: u64 = 100;

/// Consecutive rejections above which a bucket counts as saturated.
const SUSTAINED_PRESSURE_REJECTIONS: u32 = 10;

/// Lock-free token bucket.
///
/// ## Example
///
/// ```rust
/// use tasker::{BucketConfig, TokenBucket};
/// use std::sync::Arc;
/// use std::thread;
///
/// let bucket = Arc::new(TokenBucket::new(BucketConfig::new(100, 10.0)));
///
/// let mut handles = vec![];
/// for _ in 0..4 {
///     let bucket = bucket.clone();
///     handles.push(thread::spawn(move || {
///         (0..25).filter(|_| bucket.try_acquire()).count()
///     }));
/// }
/// let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
/// assert_eq!(admitted, 100);
/// ```
pub struct TokenBucket {
    /// Current tokens in micro-tokens.
    tokens: CachePadded<AtomicU64>,

    /// Monotonic microsecond timestamp up to which refill has been credited.
    last_refill_us: CachePadded<AtomicU64>,

    /// Last time the bucket was used, for idle eviction.
    pub(crate) last_access_ms: CachePadded<AtomicU64>,

    consecutive_rejections: AtomicU32,

    config: BucketConfig,
    capacity_micros: u64,

    total_acquired: AtomicU64,
    total_rejected: AtomicU64,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid (see [`BucketConfig::validate`]).
    /// Use [`TokenBucket::try_new`] to handle the error instead.
    pub fn new(config: BucketConfig) -> Self {
        match Self::try_new(config) {
            Ok(bucket) => bucket,
            Err(err) => panic!("invalid token bucket configuration: {err}"),
        }
    }

    /// Creates a full bucket, validating the configuration first.
    ///
    /// # Errors
    ///
    /// Returns the validation error from [`BucketConfig::validate`].
    pub fn try_new(config: BucketConfig) -> Result<Self, crate::ConfigError> {
        config.validate()?;

        let capacity_micros = config.capacity_micros();
        Ok(Self {
            tokens: CachePadded::new(AtomicU64::new(capacity_micros)),
            last_refill_us: CachePadded::new(AtomicU64::new(current_time_us())),
            last_access_ms: CachePadded::new(AtomicU64::new(current_time_ms())),
            consecutive_rejections: AtomicU32::new(0),
            config,
            capacity_micros,
            total_acquired: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        })
    }

    /// Creates a bucket with `config` that takes over this bucket's tokens,
    /// capped at the new capacity.
    ///
    /// This bucket is emptied in the process, so callers still holding it
    /// cannot spend the same tokens twice.
    ///
    /// # Errors
    ///
    /// Returns the validation error from [`BucketConfig::validate`].
    pub fn resized(&self, config: BucketConfig) -> Result<Self, crate::ConfigError> {
        let bucket = Self::try_new(config)?;
        self.refill(current_time_us());
        let carried = self.tokens.swap(0, Ordering::AcqRel);
        bucket
            .tokens
            .store(carried.min(bucket.capacity_micros), Ordering::Release);
        Ok(bucket)
    }

    /// Attempts to take one token.
    ///
    /// Returns immediately: `true` if a token was taken, `false` if the bucket
    /// is empty. The caller never waits for a refill.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let now_us = current_time_us();
        self.touch(now_us / 1000);
        self.refill(now_us);

        let backoff = Backoff::new();
        let mut retries = 0;
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current < MICROS_PER_TOKEN {
                self.on_rejection();
                return false;
            }

            match self.tokens.compare_exchange_weak(
                current,
                current - MICROS_PER_TOKEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.on_acquisition();
                    return true;
                }
                Err(actual) if actual < MICROS_PER_TOKEN => {
                    self.on_rejection();
                    return false;
                }
                Err(_) => {
                    retries += 1;
                    if retries >= MAX_CAS_RETRIES {
                        warn!(retries, "token bucket CAS retry limit reached");
                        self.on_rejection();
                        return false;
                    }
                    backoff.spin();
                }
            }
        }
    }

    #[inline]
    fn touch(&self, now_ms: u64) {
        let last = self.last_access_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) > LAST_ACCESS_UPDATE_INTERVAL_MS {
            self.last_access_ms.store(now_ms, Ordering::Relaxed);
        }
    }

    /// Credits the interval since `last_refill_us`, if this thread wins it.
    #[inline]
    fn refill(&self, now_us: u64) {
        if self.config.refill_rate <= 0.0 {
            return;
        }

        let last = self.last_refill_us.load(Ordering::Acquire);
        let elapsed_us = now_us.saturating_sub(last);
        if elapsed_us == 0 {
            return;
        }

        // rate tokens/s == rate micro-tokens/µs
        let credit = (elapsed_us as f64 * self.config.refill_rate)
            .min(self.capacity_micros as f64) as u64;
        if credit == 0 {
            // Leave the interval unclaimed so it keeps accumulating.
            return;
        }

        if self
            .last_refill_us
            .compare_exchange(last, now_us, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread claimed this interval.
            return;
        }

        let capacity = self.capacity_micros;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(tokens.saturating_add(credit).min(capacity))
            });
    }

    #[inline]
    fn on_acquisition(&self) {
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        if self.consecutive_rejections.load(Ordering::Relaxed) > 0 {
            self.consecutive_rejections.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    fn on_rejection(&self) {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        let streak = self.consecutive_rejections.fetch_add(1, Ordering::Relaxed) + 1;
        if streak == SUSTAINED_PRESSURE_REJECTIONS + 1 {
            debug!(
                capacity = self.config.capacity,
                refill_rate = self.config.refill_rate,
                "token bucket under sustained pressure"
            );
        }
    }

    /// Returns the number of whole tokens available right now.
    ///
    /// Triggers a refill first, so the value reflects elapsed time.
    pub fn available_tokens(&self) -> u64 {
        self.refill(current_time_us());
        self.tokens.load(Ordering::Acquire) / MICROS_PER_TOKEN
    }

    /// Returns `true` if the bucket has not been used for `idle_ms` milliseconds.
    #[inline]
    pub fn is_idle(&self, idle_ms: u64) -> bool {
        let last = self.last_access_ms.load(Ordering::Relaxed);
        current_time_ms().saturating_sub(last) > idle_ms
    }

    /// Milliseconds since the bucket was last used.
    #[inline]
    pub(crate) fn idle_for_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_access_ms.load(Ordering::Relaxed))
    }

    /// Returns the configuration this bucket was built from.
    #[inline]
    pub fn config(&self) -> BucketConfig {
        self.config
    }

    /// Returns a snapshot of the bucket's counters.
    pub fn metrics(&self) -> BucketMetrics {
        BucketMetrics {
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            current_tokens: self.tokens.load(Ordering::Acquire) / MICROS_PER_TOKEN,
            capacity: self.config.capacity,
            consecutive_rejections: self.consecutive_rejections.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.config.capacity)
            .field("refill_rate", &self.config.refill_rate)
            .field("current_tokens", &(self.tokens.load(Ordering::Acquire) / MICROS_PER_TOKEN))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_burst_then_reject() {
        let bucket = TokenBucket::new(BucketConfig::new(10, 1.0));

        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        let metrics = bucket.metrics();
        assert_eq!(metrics.total_acquired, 10);
        assert_eq!(metrics.total_rejected, 1);
    }

    #[test]
    fn test_ten_per_second_burst_ten_admits_exactly_ten_of_fifteen() {
        let bucket = TokenBucket::new(BucketConfig::new(10, 10.0));

        let admitted = (0..15).filter(|_| bucket.try_acquire()).count();

        assert_eq!(admitted, 10);
        assert_eq!(bucket.metrics().total_rejected, 5);
    }

    #[test]
    fn test_continuous_refill() {
        let bucket = TokenBucket::new(BucketConfig::new(5, 50.0));
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // 50 tokens/s → one token every 20ms
        thread::sleep(Duration::from_millis(70));
        let available = bucket.available_tokens();
        assert!((2..=5).contains(&available), "available = {available}");
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let bucket = TokenBucket::new(BucketConfig::new(3, 1000.0));
        assert!(bucket.try_acquire());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(bucket.available_tokens(), 3);
    }

    #[test]
    fn test_resized_carries_tokens_over() {
        let bucket = TokenBucket::new(BucketConfig::new(10, 0.0));
        for _ in 0..7 {
            assert!(bucket.try_acquire());
        }

        let larger = bucket.resized(BucketConfig::new(50, 0.0)).unwrap();
        assert_eq!(larger.available_tokens(), 3);
        assert_eq!(bucket.available_tokens(), 0);

        let smaller = larger.resized(BucketConfig::new(2, 0.0)).unwrap();
        assert_eq!(smaller.available_tokens(), 2);
        assert!(larger.resized(BucketConfig::new(0, 1.0)).is_err());
    }

    #[test]
    fn test_zero_rate_never_refills() {
        let bucket = TokenBucket::new(BucketConfig::new(2, 0.0));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        thread::sleep(Duration::from_millis(20));
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_admissions_bounded_by_burst_plus_refill() {
        let rate = 200.0;
        let burst = 5;
        let bucket = TokenBucket::new(BucketConfig::new(burst, rate));

        let start = Instant::now();
        let mut admitted = 0u64;
        while start.elapsed() < Duration::from_millis(150) {
            if bucket.try_acquire() {
                admitted += 1;
            }
        }
        let elapsed = start.elapsed().as_secs_f64();

        let bound = burst + (elapsed * rate).floor() as u64;
        assert!(admitted <= bound, "admitted {admitted} > bound {bound}");
        assert!(admitted > burst);
    }

    #[test]
    fn test_concurrent_acquire_never_over_admits() {
        let bucket = Arc::new(TokenBucket::new(BucketConfig::new(1000, 0.0)));
        let mut handles = vec![];

        for _ in 0..10 {
            let bucket = bucket.clone();
            handles.push(thread::spawn(move || {
                (0..200).filter(|_| bucket.try_acquire()).count()
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 1000);
        assert!(total >= 900);
    }

    #[test]
    fn test_is_idle() {
        let bucket = TokenBucket::new(BucketConfig::default());
        assert!(!bucket.is_idle(1000));

        thread::sleep(Duration::from_millis(150));
        assert!(bucket.is_idle(100));
        assert!(!bucket.is_idle(10_000));
    }

    #[test]
    fn test_acquire_refreshes_last_access() {
        let bucket = TokenBucket::new(BucketConfig::default());
        thread::sleep(Duration::from_millis(150));
        assert!(bucket.is_idle(100));

        bucket.try_acquire();
        assert!(!bucket.is_idle(100));
    }

    #[test]
    fn test_consecutive_rejections_reset_on_success() {
        let bucket = TokenBucket::new(BucketConfig::new(1, 100.0));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert!(bucket.metrics().consecutive_rejections >= 1);

        thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_acquire());
        assert_eq!(bucket.metrics().consecutive_rejections, 0);
    }

    #[test]
    fn test_try_new_rejects_invalid() {
        assert!(TokenBucket::try_new(BucketConfig::new(0, 1.0)).is_err());
    }

    #[test]
    #[should_panic(expected = "invalid token bucket configuration")]
    fn test_new_panics_on_invalid() {
        let _ = TokenBucket::new(BucketConfig::new(0, 1.0));
    }

    #[test]
    fn test_debug_impl() {
        let bucket = TokenBucket::new(BucketConfig::new(10, 5.0));
        let debug_str = format!("{:?}", bucket);

        assert!(debug_str.contains("TokenBucket"));
        assert!(debug_str.contains("capacity: 10"));
        assert!(debug_str.contains("refill_rate: 5.0"));
    }
}
