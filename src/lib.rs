//! # Tasker - Background Concurrency Layer for a Task Service
//!
//! The parts of a task-management backend that run beside the request
//! handlers rather than inside them:
//!
//! - **Admission control**: a global token bucket plus one bucket per client
//!   identity, answered synchronously and without waiting.
//! - **Async log pipeline**: handlers fire log records into a bounded queue;
//!   a writer thread batches them into a sink.
//! - **Task completion worker**: a scanner finds tasks left pending too long
//!   and a processor completes them, unless a user got there first.
//!
//! ## Architecture Overview
//!
//! ```text
//!                request threads
//!       ┌───────────────┬───────────────┐
//!       ▼               ▼               │
//! ┌───────────┐   ┌──────────┐          │
//! │ Admission │   │  Logger  │          │
//! │  global   │   └────┬─────┘          │
//! │  identity │        │ try_send       │
//! └───────────┘        ▼                │
//!                ┌───────────┐   ┌──────┴────────────────┐
//!                │ log queue │   │ TaskCompletionWorker  │
//!                └─────┬─────┘   │ scanner ─► queue(100) │
//!                      ▼         │ processor ◄────┘      │
//!                writer thread   └──────────┬────────────┘
//!                      ▼                    ▼
//!                   LogSink             TaskStore
//!
//!        One ShutdownSignal reaches every loop.
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tasker::prelude::*;
//!
//! let settings = Arc::new(LiveSettings::new(Settings::default()));
//! let store = Arc::new(MemoryTaskStore::new());
//! let services = Services::start(settings, store, CaptureSink::new()).unwrap();
//!
//! match services.admission().allow("192.168.1.100") {
//!     Decision::Admitted => {
//!         services.logger().info("request admitted", vec![field("ip", "192.168.1.100")]);
//!     }
//!     rejected => {
//!         // Respond 429 with rejected.reason()
//!         assert!(rejected.reason().is_some());
//!     }
//! }
//!
//! let report = services.shutdown(Duration::from_secs(5));
//! assert!(report.is_clean());
//! ```
//!
//! ## Error Philosophy
//!
//! | Situation | Surfaces as |
//! |-----------|-------------|
//! | request over the limit | [`Decision`] value |
//! | log queue full | dropped counter |
//! | task queue full | skipped counter, re-scanned later |
//! | sink or store failure | logged, not retried |
//! | bad settings, thread spawn failure | [`ConfigError`], [`StartError`] |
//!
//! ## Thread Safety
//!
//! [`Admission`], [`Logger`], [`AsyncLogPipeline`] and
//! [`TaskCompletionWorker`] are all `Send + Sync` and meant to be shared via
//! `Arc` (or, for `Logger`, cloned).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

mod error;
mod logging;
mod rate_limiter;
mod services;
mod settings;
mod shutdown;
mod worker;

pub use error::{ConfigError, SpawnError, StartError, StoreError};
pub use logging::{
    field, to_json, AsyncLogPipeline, CaptureSink, Field, JsonLinesSink, Level, LogRecord,
    LogSink, Logger, ParseLevelError, PipelineConfig, PipelineState, PipelineStats,
};
pub use rate_limiter::{
    current_time_ms, current_time_us, Admission, BucketConfig, BucketMetrics, Decision,
    HealthStatus, IdentityRegistry, RegistryStats, TokenBucket, DEFAULT_IDLE_EVICTION_MS,
    DEFAULT_MAX_IDENTITIES, DEFAULT_SWEEP_INTERVAL_MS,
};
pub use services::{Services, ShutdownReport};
pub use settings::{
    LiveSettings, LoggerSettings, RateLimitSettings, Settings, SettingsSource, WorkerSettings,
};
pub use shutdown::{BackgroundThread, ShutdownListener, ShutdownSignal};
pub use worker::{
    CompletionOutcome, MemoryTaskStore, ScanReport, Task, TaskCompletionWorker, TaskId,
    TaskStatus, TaskStore, WorkerStats, TASK_QUEUE_CAPACITY,
};

/// An [`Admission`] controller wrapped in `Arc` for sharing across handler threads.
///
/// # Example
/// ```rust
/// use tasker::{Admission, RateLimitSettings, SharedAdmission};
/// use std::sync::Arc;
///
/// let shared: SharedAdmission = Arc::new(Admission::new(&RateLimitSettings::default()).unwrap());
///
/// let handle = shared.clone();
/// std::thread::spawn(move || {
///     handle.allow("10.0.0.1");
/// })
/// .join()
/// .unwrap();
/// ```
pub type SharedAdmission = std::sync::Arc<Admission>;

/// A task store behind a trait object, as the worker consumes it.
pub type SharedTaskStore = std::sync::Arc<dyn TaskStore>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use tasker::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for wiring the background layer into a service.
    //!
    //! # Example
    //! ```rust
    //! use tasker::prelude::*;
    //!
    //! let settings = Settings::default();
    //! let admission = Admission::new(&settings.rate_limit).unwrap();
    //! assert_eq!(admission.allow("a"), Decision::Admitted);
    //! ```

    pub use crate::{
        field, Admission, AsyncLogPipeline, CaptureSink, CompletionOutcome, Decision,
        JsonLinesSink, Level, LiveSettings, LogRecord, LogSink, Logger, MemoryTaskStore,
        Services, Settings, SettingsSource, SharedAdmission, SharedTaskStore, ShutdownSignal,
        TaskCompletionWorker, TaskId, TaskStatus, TaskStore,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(MSRV, "1.70.0");
    }

    #[test]
    fn test_shared_admission_across_threads() {
        let settings = RateLimitSettings {
            global_rate: 0.0,
            global_burst: 1000,
            ip_rate: 0.0,
            ip_burst: 10,
            ..RateLimitSettings::default()
        };
        let admission: SharedAdmission = Arc::new(Admission::new(&settings).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let admission = admission.clone();
                thread::spawn(move || {
                    let ip = format!("192.168.0.{i}");
                    (0..20).filter(|_| admission.allow(&ip).is_admitted()).count()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 10);
        }
        assert_eq!(admission.registry().active_identities(), 4);
    }

    #[test]
    fn test_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Admission>();
        assert_send_sync::<AsyncLogPipeline>();
        assert_send_sync::<Logger>();
        assert_send_sync::<TaskCompletionWorker>();
        assert_send_sync::<Services>();
        assert_send_sync::<LiveSettings>();
    }
}
