//! # Settings
//!
//! Typed configuration read by every component. Values come from a TOML
//! document; anything missing falls back to its default.
//!
//! ```toml
//! auto_complete_minutes = 30
//!
//! [rate_limit]
//! global_rate = 100.0
//! global_burst = 200
//! ip_rate = 10.0
//! ip_burst = 20
//!
//! [logger]
//! level = "info"
//! buffer_size = 10000
//! batch_size = 100
//! flush_delay_ms = 2000
//!
//! [worker]
//! scan_interval_secs = 30
//! ```
//!
//! Admission and the completion worker hold a [`SettingsSource`] and read a
//! fresh snapshot when they need one, so a [`LiveSettings::replace`] is
//! picked up on the next admission check or scan cycle. Queue sizes are
//! fixed when the log pipeline starts.

use crate::error::ConfigError;
use crate::logging::Level;
use crate::rate_limiter::BucketConfig;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pending tasks older than this many minutes are completed automatically.
    pub auto_complete_minutes: u64,

    /// Admission control.
    pub rate_limit: RateLimitSettings,

    /// Application log pipeline.
    pub logger: LoggerSettings,

    /// Task completion worker.
    pub worker: WorkerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_complete_minutes: 30,
            rate_limit: RateLimitSettings::default(),
            logger: LoggerSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

/// Global and per-identity token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Global tokens per second.
    pub global_rate: f64,
    /// Global burst.
    pub global_burst: u64,
    /// Per-identity tokens per second.
    pub ip_rate: f64,
    /// Per-identity burst.
    pub ip_burst: u64,
    /// Seconds without a request before an identity's bucket is evicted.
    pub idle_eviction_secs: u64,
    /// Most identities tracked at once.
    pub max_identities: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global_rate: 100.0,
            global_burst: 200,
            ip_rate: 10.0,
            ip_burst: 20,
            idle_eviction_secs: 300,
            max_identities: 10_000,
        }
    }
}

impl RateLimitSettings {
    /// Bucket configuration for the shared global bucket.
    pub fn global_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.global_burst, self.global_rate)
    }

    /// Bucket configuration new identities start from.
    pub fn identity_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.ip_burst, self.ip_rate)
    }

    /// Idle time after which an identity bucket is evicted.
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
}

/// Log pipeline parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    /// Lowest level the [`Logger`](crate::Logger) accepts.
    pub level: Level,
    /// Queue capacity.
    pub buffer_size: usize,
    /// Records written per flush.
    pub batch_size: usize,
    /// Milliseconds between timer flushes.
    pub flush_delay_ms: u64,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: Level::Info,
            buffer_size: 10_000,
            batch_size: 100,
            flush_delay_ms: 2_000,
        }
    }
}

impl LoggerSettings {
    /// Timer flush interval.
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Task completion worker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Seconds between scans.
    pub scan_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
        }
    }
}

impl WorkerSettings {
    /// Interval between scans.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

impl Settings {
    /// Parses and validates a TOML document.
    ///
    /// ```rust
    /// use tasker::Settings;
    ///
    /// let settings = Settings::from_toml_str("auto_complete_minutes = 5").unwrap();
    /// assert_eq!(settings.auto_complete_minutes, 5);
    /// assert_eq!(settings.rate_limit.ip_burst, 20);
    /// ```
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed input, [`ConfigError::Invalid`]
    /// for out-of-range values.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml_str(&contents)?;
        info!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Checks every value is usable.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if !rl.global_rate.is_finite() || rl.global_rate < 0.0 {
            return Err(ConfigError::invalid("rate_limit.global_rate", "must be a finite, non-negative number"));
        }
        if rl.global_burst == 0 {
            return Err(ConfigError::invalid("rate_limit.global_burst", "must be greater than 0"));
        }
        if !rl.ip_rate.is_finite() || rl.ip_rate < 0.0 {
            return Err(ConfigError::invalid("rate_limit.ip_rate", "must be a finite, non-negative number"));
        }
        if rl.ip_burst == 0 {
            return Err(ConfigError::invalid("rate_limit.ip_burst", "must be greater than 0"));
        }
        if rl.max_identities == 0 {
            return Err(ConfigError::invalid("rate_limit.max_identities", "must be greater than 0"));
        }
        rl.global_bucket().validate()?;
        rl.identity_bucket().validate()?;

        let logger = &self.logger;
        if logger.buffer_size == 0 {
            return Err(ConfigError::invalid("logger.buffer_size", "must be greater than 0"));
        }
        if logger.batch_size == 0 {
            return Err(ConfigError::invalid("logger.batch_size", "must be greater than 0"));
        }
        if logger.flush_delay_ms == 0 {
            return Err(ConfigError::invalid("logger.flush_delay_ms", "must be greater than 0"));
        }

        if self.worker.scan_interval_secs == 0 {
            return Err(ConfigError::invalid("worker.scan_interval_secs", "must be greater than 0"));
        }
        Ok(())
    }

    /// Age after which a pending task is completed automatically.
    pub fn auto_complete_after(&self) -> Duration {
        Duration::from_secs(self.auto_complete_minutes.saturating_mul(60))
    }
}

/// Anything that can hand out the current settings.
pub trait SettingsSource: Send + Sync {
    /// Returns the settings in effect right now.
    fn current(&self) -> Arc<Settings>;
}

/// Settings that can be swapped atomically while the process runs.
///
/// Readers get a complete snapshot; they never observe a half-applied update.
///
/// ```rust
/// use tasker::{LiveSettings, Settings, SettingsSource};
///
/// let live = LiveSettings::new(Settings::default());
/// let mut next = Settings::default();
/// next.auto_complete_minutes = 1;
/// live.replace(next).unwrap();
/// assert_eq!(live.current().auto_complete_minutes, 1);
/// ```
#[derive(Debug)]
pub struct LiveSettings {
    inner: ArcSwap<Settings>,
}

impl LiveSettings {
    /// Wraps an initial value.
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: ArcSwap::from_pointee(settings),
        }
    }

    /// Validates and installs `settings`.
    ///
    /// # Errors
    ///
    /// Invalid settings are rejected and the current value is kept.
    pub fn replace(&self, settings: Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        self.inner.store(Arc::new(settings));
        info!("settings replaced");
        Ok(())
    }

    /// Loads `path` and installs the result.
    ///
    /// # Errors
    ///
    /// As [`Settings::load`]; on error the current value is kept.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let settings = Settings::load(path)?;
        self.inner.store(Arc::new(settings));
        Ok(())
    }
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl SettingsSource for LiveSettings {
    fn current(&self) -> Arc<Settings> {
        self.inner.load_full()
    }
}
