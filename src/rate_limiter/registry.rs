//! # Identity Registry
//!
//! One token bucket per source identity (normally the client IP string),
//! created the first time the identity is seen.
//!
//! ```text
//!     Client Requests:
//!     192.168.1.1 ──┐
//!     192.168.1.2 ──┤
//!     10.0.0.1 ─────┼──► IdentityRegistry ──► per-identity TokenBucket
//!     10.0.0.2 ─────┘         │
//!                             ▼
//!                 ┌───────────────────────┐
//!                 │ DashMap (N shards)    │
//!                 │  "10.0.0.1" → bucket  │
//!                 │  "10.0.0.2" → bucket  │
//!                 └───────────────────────┘
//! ```
//!
//! ## Bounded memory
//!
//! Left alone, a map keyed by client address grows with every distinct
//! address ever observed. The registry bounds it three ways:
//!
//! 1. **Idle sweep**: buckets unused for `idle_eviction_ms` are removed by
//!    [`sweep`](IdentityRegistry::sweep), run periodically by the sweeper thread.
//! 2. **Hard cap**: at most `max_identities` buckets exist at once.
//! 3. **Emergency eviction**: at 90% of the cap the least recently seen
//!    identities are evicted down to 70%.
//!
//! The map is sharded, so lookups for different identities rarely contend,
//! and the shard lock is released before the bucket computation runs.

use super::{config::BucketConfig, core::TokenBucket, utils::current_time_ms};
use crate::error::SpawnError;
use crate::shutdown::{BackgroundThread, ShutdownListener};
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on tracked identities.
pub const DEFAULT_MAX_IDENTITIES: usize = 10_000;

/// Default idle time after which an identity's bucket is evicted.
pub const DEFAULT_IDLE_EVICTION_MS: u64 = 300_000;

/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Percentage of `max_identities` at which emergency eviction starts.
const EMERGENCY_THRESHOLD_PERCENT: usize = 90;

/// Percentage of `max_identities` emergency eviction reduces the map to.
const EMERGENCY_TARGET_PERCENT: usize = 70;

/// Per-identity token buckets with bounded, self-cleaning storage.
///
/// ```rust
/// use tasker::{BucketConfig, IdentityRegistry};
///
/// let registry = IdentityRegistry::new(BucketConfig::new(5, 1.0));
///
/// for _ in 0..5 {
///     assert!(registry.try_acquire("192.168.1.1"));
/// }
/// assert!(!registry.try_acquire("192.168.1.1"));
///
/// // A different identity has its own quota
/// assert!(registry.try_acquire("192.168.1.2"));
/// assert_eq!(registry.active_identities(), 2);
/// ```
pub struct IdentityRegistry {
    buckets: DashMap<String, Arc<TokenBucket>, ahash::RandomState>,

    /// Entry count kept alongside the map so capacity checks don't lock shards.
    active_count: AtomicUsize,

    /// Template for buckets created from now on.
    template: ArcSwap<BucketConfig>,

    max_identities: AtomicUsize,
    idle_eviction_ms: AtomicU64,
    sweep_interval_ms: AtomicU64,

    total_created: AtomicU64,
    total_evicted: AtomicU64,

    eviction_in_progress: AtomicBool,
}

impl IdentityRegistry {
    /// Creates a registry with default bounds.
    ///
    /// # Panics
    ///
    /// Panics if `template` is invalid.
    pub fn new(template: BucketConfig) -> Self {
        Self::with_limits(
            template,
            DEFAULT_MAX_IDENTITIES,
            DEFAULT_IDLE_EVICTION_MS,
            DEFAULT_SWEEP_INTERVAL_MS,
        )
    }

    /// Creates a registry with explicit bounds.
    ///
    /// # Arguments
    ///
    /// * `template` - Configuration for newly created buckets
    /// * `max_identities` - Hard cap on tracked identities (at least 1)
    /// * `idle_eviction_ms` - Idle time after which a bucket is swept
    /// * `sweep_interval_ms` - How often the sweeper thread runs
    ///
    /// # Panics
    ///
    /// Panics if `template` is invalid.
    pub fn with_limits(
        template: BucketConfig,
        max_identities: usize,
        idle_eviction_ms: u64,
        sweep_interval_ms: u64,
    ) -> Self {
        if let Err(err) = template.validate() {
            panic!("invalid identity bucket template: {err}");
        }

        let num_shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two()
            .clamp(4, 64);
        let max_identities = max_identities.max(1);
        let initial_capacity = (max_identities / num_shards).clamp(16, 1024);

        Self {
            buckets: DashMap::with_capacity_and_hasher_and_shard_amount(
                initial_capacity,
                ahash::RandomState::new(),
                num_shards,
            ),
            active_count: AtomicUsize::new(0),
            template: ArcSwap::from_pointee(template),
            max_identities: AtomicUsize::new(max_identities),
            idle_eviction_ms: AtomicU64::new(idle_eviction_ms),
            sweep_interval_ms: AtomicU64::new(sweep_interval_ms.max(1)),
            total_created: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
            eviction_in_progress: AtomicBool::new(false),
        }
    }

    #[inline]
    fn max_identities(&self) -> usize {
        self.max_identities.load(Ordering::Relaxed)
    }

    #[inline]
    fn emergency_threshold(&self) -> usize {
        (self.max_identities() * EMERGENCY_THRESHOLD_PERCENT / 100).max(1)
    }

    #[inline]
    fn emergency_target(&self) -> usize {
        self.max_identities() * EMERGENCY_TARGET_PERCENT / 100
    }

    /// Returns the bucket for `identity`, creating it on first sight.
    ///
    /// Returns `None` only when the registry is full and eviction could not
    /// make room.
    pub fn get(&self, identity: &str) -> Option<Arc<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(identity) {
            return Some(bucket.clone());
        }

        let current = self.active_count.load(Ordering::Acquire);
        if current >= self.emergency_threshold() {
            self.evict_least_recent();
        }
        let max_identities = self.max_identities();
        if self.active_count.load(Ordering::Acquire) >= max_identities {
            warn!(identity, max = max_identities, "identity registry full, rejecting");
            return None;
        }

        match self.buckets.entry(identity.to_owned()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let prev = self.active_count.fetch_add(1, Ordering::AcqRel);
                if prev >= max_identities {
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                    warn!(identity, "identity registry capacity race, rejecting");
                    return None;
                }

                let bucket = Arc::new(TokenBucket::new(**self.template.load()));
                vacant.insert(bucket.clone());
                self.total_created.fetch_add(1, Ordering::Relaxed);
                debug!(identity, total = prev + 1, "created identity bucket");
                Some(bucket)
            }
        }
    }

    /// Takes one token from `identity`'s bucket.
    ///
    /// The shard lock is only held for the lookup; the token computation runs
    /// on the bucket's own atomics.
    #[inline]
    pub fn try_acquire(&self, identity: &str) -> bool {
        match self.get(identity) {
            Some(bucket) => bucket.try_acquire(),
            None => false,
        }
    }

    /// Replaces the template used for buckets created from now on.
    ///
    /// Existing buckets keep their configuration and state until evicted.
    pub fn set_template(&self, template: BucketConfig) {
        self.template.store(Arc::new(template));
    }

    /// Returns the template for new buckets.
    pub fn template(&self) -> BucketConfig {
        **self.template.load()
    }

    /// Changes the capacity bound and idle eviction time.
    ///
    /// Nothing is evicted right away; a lower cap takes effect on the next
    /// insert, a shorter idle time on the next sweep. The sweeper picks up
    /// the new interval after its current wait.
    pub fn set_limits(&self, max_identities: usize, idle_eviction_ms: u64, sweep_interval_ms: u64) {
        self.max_identities.store(max_identities.max(1), Ordering::Relaxed);
        self.idle_eviction_ms.store(idle_eviction_ms, Ordering::Relaxed);
        self.sweep_interval_ms.store(sweep_interval_ms.max(1), Ordering::Relaxed);
    }

    /// Evicts the least recently seen identities down to 70% of the cap.
    fn evict_least_recent(&self) {
        if self
            .eviction_in_progress
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let _guard = EvictionGuard {
            flag: &self.eviction_in_progress,
        };

        let before = self.active_count.load(Ordering::Acquire);
        let target = self.emergency_target();
        if before <= target {
            return;
        }
        let to_remove = before - target;

        info!(before, target, "starting emergency identity eviction");

        let now = current_time_ms();
        let mut candidates: Vec<(u64, String)> = self
            .buckets
            .iter()
            .map(|entry| (entry.value().idle_for_ms(now), entry.key().clone()))
            .collect();
        // Most idle first
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0u64;
        for (_, identity) in candidates.into_iter().take(to_remove) {
            if self.buckets.remove(&identity).is_some() {
                self.active_count.fetch_sub(1, Ordering::AcqRel);
                removed += 1;
            }
        }

        self.total_evicted.fetch_add(removed, Ordering::Relaxed);
        info!(removed, remaining = self.active_count.load(Ordering::Acquire), "emergency eviction finished");
    }

    /// Removes buckets idle for longer than the configured idle time.
    ///
    /// Near capacity the idle threshold is halved. Returns the number removed.
    pub fn sweep(&self) -> usize {
        if self.eviction_in_progress.load(Ordering::Acquire) {
            return 0;
        }

        let idle_eviction_ms = self.idle_eviction_ms.load(Ordering::Relaxed);
        let threshold = if self.active_count.load(Ordering::Acquire) > self.emergency_threshold() {
            idle_eviction_ms / 2
        } else {
            idle_eviction_ms
        };

        let mut removed = 0usize;
        self.buckets.retain(|identity, bucket| {
            if bucket.is_idle(threshold) {
                debug!(identity = identity.as_str(), "evicting idle identity bucket");
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.active_count.fetch_sub(removed, Ordering::AcqRel);
            self.total_evicted.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "idle sweep finished");
        }

        let capacity = self.buckets.capacity();
        let len = self.buckets.len();
        if capacity > len * 4 && capacity > 1024 {
            self.buckets.shrink_to_fit();
        }

        removed
    }

    /// Starts a thread that runs [`sweep`](Self::sweep) every sweep interval
    /// until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the thread cannot be created.
    pub fn start_sweeper(
        self: Arc<Self>,
        shutdown: ShutdownListener,
    ) -> Result<BackgroundThread, SpawnError> {
        BackgroundThread::spawn("tasker-registry-sweeper", move || {
            info!(
                interval_ms = self.sweep_interval_ms.load(Ordering::Relaxed),
                idle_ms = self.idle_eviction_ms.load(Ordering::Relaxed),
                "registry sweeper started"
            );

            loop {
                let interval = Duration::from_millis(self.sweep_interval_ms.load(Ordering::Relaxed));
                if shutdown.wait_timeout(interval) {
                    break;
                }
                self.sweep();

                let active = self.active_identities();
                if active > self.emergency_threshold() {
                    warn!(
                        active,
                        percent = active * 100 / self.max_identities(),
                        "identity registry near capacity"
                    );
                }
            }
            info!("registry sweeper stopped");
        })
    }

    /// Number of identities currently tracked.
    #[inline]
    pub fn active_identities(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Drops every bucket.
    ///
    /// Identities inserted concurrently may survive the clear; the count
    /// only drops by what was actually removed.
    pub fn clear(&self) {
        let mut count = 0usize;
        self.buckets.retain(|_, _| {
            count += 1;
            false
        });
        self.active_count.fetch_sub(count, Ordering::AcqRel);
        self.total_evicted.fetch_add(count as u64, Ordering::Relaxed);
        info!(count, "cleared identity registry");
    }

    /// Returns registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let active = self.active_identities();
        let max_identities = self.max_identities();
        RegistryStats {
            active_identities: active,
            total_created: self.total_created.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
            capacity_used: active as f64 / max_identities as f64,
            max_identities,
        }
    }
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("active_identities", &self.active_identities())
            .field("max_identities", &self.max_identities())
            .field("idle_eviction_ms", &self.idle_eviction_ms.load(Ordering::Relaxed))
            .field("sweep_interval_ms", &self.sweep_interval_ms.load(Ordering::Relaxed))
            .finish()
    }
}

/// Resets the eviction flag however eviction exits.
struct EvictionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for EvictionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Statistics for an [`IdentityRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Identities currently tracked.
    pub active_identities: usize,

    /// Buckets created since startup.
    pub total_created: u64,

    /// Buckets evicted (idle sweep, emergency eviction or clear) since startup.
    pub total_evicted: u64,

    /// Fraction of `max_identities` in use (0.0 to 1.0).
    pub capacity_used: f64,

    /// Hard cap on tracked identities.
    pub max_identities: usize,
}

impl RegistryStats {
    /// Human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Identity Registry Stats:\n\
             ├─ Capacity:\n\
             │  ├─ Active Identities: {}/{}\n\
             │  └─ Capacity Used: {:.2}%\n\
             └─ Lifetime:\n\
                ├─ Total Created: {}\n\
                └─ Total Evicted: {}",
            self.active_identities,
            self.max_identities,
            self.capacity_used * 100.0,
            self.total_created,
            self.total_evicted,
        )
    }

    /// More than 80% of the cap is in use.
    pub fn is_near_capacity(&self) -> bool {
        self.capacity_used > 0.8
    }

    /// Evicted over created; low values on a long-running process mean growth.
    pub fn eviction_ratio(&self) -> f64 {
        if self.total_created == 0 {
            0.0
        } else {
            self.total_evicted as f64 / self.total_created as f64
        }
    }
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary())
    }
}
