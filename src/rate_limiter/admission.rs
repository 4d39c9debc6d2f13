//! # Admission Control
//!
//! Combines the shared global bucket with the per-identity registry.
//!
//! ```text
//!     allow("10.0.0.1")
//!          │
//!          ▼
//!     ┌──────────────┐  empty   ┌────────────────┐
//!     │ global bucket├─────────►│ RejectedGlobal │
//!     └──────┬───────┘          └────────────────┘
//!            │ token taken
//!            ▼
//!     ┌──────────────┐  empty   ┌──────────────────┐
//!     │ identity     ├─────────►│ RejectedIdentity │
//!     │ bucket       │          └──────────────────┘
//!     └──────┬───────┘
//!            ▼
//!        Admitted
//! ```
//!
//! The global check runs first so a flood from many identities is cut off
//! before the registry is touched. A request rejected by its identity bucket
//! has still spent a global token.

use super::{config::BucketConfig, core::TokenBucket, metrics::BucketMetrics, registry::IdentityRegistry};
use crate::error::{ConfigError, SpawnError};
use crate::settings::{RateLimitSettings, Settings, SettingsSource};
use crate::shutdown::{BackgroundThread, ShutdownListener};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, trace};

/// Default interval between registry sweeps started through [`Admission`].
const SWEEP_INTERVAL_MS: u64 = 60_000;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Both buckets had a token.
    Admitted,
    /// The shared global bucket was empty.
    RejectedGlobal,
    /// The caller's own bucket was empty, or no bucket could be allocated.
    RejectedIdentity,
}

impl Decision {
    /// Returns `true` for [`Decision::Admitted`].
    #[inline]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Message suitable for a too-many-requests response, `None` if admitted.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Admitted => None,
            Self::RejectedGlobal => Some("global rate limit exceeded"),
            Self::RejectedIdentity => Some("rate limit exceeded for your IP"),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason().unwrap_or("admitted"))
    }
}

/// Global plus per-identity rate limiting.
///
/// ```rust
/// use tasker::{Admission, Decision, RateLimitSettings};
///
/// let settings = RateLimitSettings {
///     global_rate: 0.0,
///     global_burst: 3,
///     ip_rate: 0.0,
///     ip_burst: 2,
///     ..RateLimitSettings::default()
/// };
/// let admission = Admission::new(&settings).unwrap();
///
/// assert_eq!(admission.allow("a"), Decision::Admitted);
/// assert_eq!(admission.allow("a"), Decision::Admitted);
/// assert_eq!(admission.allow("a"), Decision::RejectedIdentity);
/// assert_eq!(admission.allow("b"), Decision::RejectedGlobal);
/// ```
pub struct Admission {
    global: ArcSwap<TokenBucket>,
    registry: Arc<IdentityRegistry>,

    /// Where live settings come from, if anywhere.
    source: Option<Arc<dyn SettingsSource>>,

    /// Snapshot the buckets were last built from.
    applied: ArcSwap<Settings>,
}

impl Admission {
    /// Builds an admission controller from fixed settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings are invalid.
    pub fn new(settings: &RateLimitSettings) -> Result<Self, ConfigError> {
        let full = Settings {
            rate_limit: settings.clone(),
            ..Settings::default()
        };
        full.validate()?;
        Ok(Self::build(Arc::new(full), None))
    }

    /// Builds an admission controller that follows `source`.
    ///
    /// Each check compares the source's current snapshot with the one in use
    /// and reconfigures when it changed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the current settings are invalid.
    pub fn from_source(source: Arc<dyn SettingsSource>) -> Result<Self, ConfigError> {
        let current = source.current();
        current.validate()?;
        Ok(Self::build(current, Some(source)))
    }

    fn build(settings: Arc<Settings>, source: Option<Arc<dyn SettingsSource>>) -> Self {
        let rl = &settings.rate_limit;
        let registry = IdentityRegistry::with_limits(
            rl.identity_bucket(),
            rl.max_identities,
            idle_eviction_ms(rl),
            sweep_interval_ms(rl),
        );
        Self {
            global: ArcSwap::from_pointee(TokenBucket::new(rl.global_bucket())),
            registry: Arc::new(registry),
            source,
            applied: ArcSwap::new(settings),
        }
    }

    /// Picks up a settings change, if there is one.
    fn refresh(&self) {
        let Some(source) = &self.source else {
            return;
        };
        let latest = source.current();
        let applied = self.applied.load();
        if Arc::ptr_eq(&*applied, &latest) {
            return;
        }

        // One caller wins the swap and rebuilds; everyone else keeps going
        // with whichever bucket they load.
        let previous = self.applied.compare_and_swap(&*applied, latest.clone());
        if Arc::ptr_eq(&*previous, &*applied) && applied.rate_limit != latest.rate_limit {
            self.reconfigure(&latest.rate_limit);
        }
    }

    /// Applies new rate limits.
    ///
    /// The global bucket is rebuilt only when its rate or burst changed, and
    /// the new one keeps the tokens the old one had (capped at the new
    /// burst), so a reload never hands out extra admissions. New identities
    /// use the new template; existing identity buckets keep their state
    /// until they are evicted. Invalid settings are ignored.
    pub fn reconfigure(&self, settings: &RateLimitSettings) {
        let global = settings.global_bucket();
        let identity = settings.identity_bucket();
        if global.validate().is_err() || identity.validate().is_err() {
            return;
        }

        let current = self.global.load_full();
        if current.config() != global {
            match current.resized(global) {
                Ok(bucket) => self.global.store(Arc::new(bucket)),
                Err(_) => return,
            }
        }
        self.registry.set_template(identity);
        self.registry.set_limits(
            settings.max_identities,
            idle_eviction_ms(settings),
            sweep_interval_ms(settings),
        );
        info!(
            global_rate = settings.global_rate,
            global_burst = settings.global_burst,
            ip_rate = settings.ip_rate,
            ip_burst = settings.ip_burst,
            "rate limits reconfigured"
        );
    }

    /// Checks the global bucket only.
    #[inline]
    pub fn allow_global(&self) -> bool {
        self.refresh();
        self.global.load().try_acquire()
    }

    /// Checks the global bucket, then `identity`'s bucket.
    pub fn allow(&self, identity: &str) -> Decision {
        self.refresh();

        if !self.global.load().try_acquire() {
            trace!(identity, "rejected by global limit");
            return Decision::RejectedGlobal;
        }
        if !self.registry.try_acquire(identity) {
            trace!(identity, "rejected by identity limit");
            return Decision::RejectedIdentity;
        }
        Decision::Admitted
    }

    /// The per-identity registry.
    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Counters of the current global bucket.
    pub fn global_metrics(&self) -> BucketMetrics {
        self.global.load().metrics()
    }

    /// Configuration of the current global bucket.
    pub fn global_config(&self) -> BucketConfig {
        self.global.load().config()
    }

    /// Starts the idle sweeper for the identity registry.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if the thread cannot be created.
    pub fn start_sweeper(&self, shutdown: ShutdownListener) -> Result<BackgroundThread, SpawnError> {
        self.registry.clone().start_sweeper(shutdown)
    }
}

fn idle_eviction_ms(settings: &RateLimitSettings) -> u64 {
    settings.idle_eviction().as_millis() as u64
}

fn sweep_interval_ms(settings: &RateLimitSettings) -> u64 {
    SWEEP_INTERVAL_MS.min(settings.idle_eviction_secs.saturating_mul(1000).max(1))
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("global", &**self.global.load())
            .field("registry", &self.registry)
            .field("live", &self.source.is_some())
            .finish()
    }
}
