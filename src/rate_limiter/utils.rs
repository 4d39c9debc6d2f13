//! # Clock Helpers (utils.rs)
//!
//! Token buckets and the registry sweeper measure elapsed time, never
//! absolute time, so every reading here is derived from one monotonic
//! `Instant` captured the first time any of them is called.
//!
//! ```text
//!     process start ──► CLOCK_BASE (Instant, epoch ms)
//!                            │
//!          now ──────────────┴──► base_ms + Instant::elapsed()
//! ```
//!
//! A wall-clock jump (NTP correction, manual change) cannot make a bucket
//! refill backwards or grant a burst of tokens.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static CLOCK_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

#[inline(always)]
fn clock_base() -> &'static (Instant, u64) {
    CLOCK_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    })
}

/// Returns the current time in milliseconds since UNIX epoch.
///
/// The value advances monotonically for the life of the process.
///
/// # Example
///
/// ```rust
/// use tasker::current_time_ms;
///
/// let before = current_time_ms();
/// let after = current_time_ms();
/// assert!(after >= before);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = clock_base();
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// Returns the current time in microseconds since UNIX epoch.
///
/// Token refill is computed from this reading.
#[inline(always)]
pub fn current_time_us() -> u64 {
    let (start, base_ms) = clock_base();
    base_ms
        .saturating_mul(1000)
        .saturating_add(start.elapsed().as_micros() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_clock_is_monotonic() {
        let mut last = current_time_us();
        for _ in 0..1000 {
            let now = current_time_us();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_ms_and_us_agree() {
        let ms = current_time_ms();
        let us = current_time_us();
        assert!(us / 1000 >= ms);
        assert!(us / 1000 - ms < 50);
    }

    #[test]
    fn test_clock_advances() {
        let start = current_time_ms();
        thread::sleep(Duration::from_millis(20));
        assert!(current_time_ms() - start >= 20);
    }
}
