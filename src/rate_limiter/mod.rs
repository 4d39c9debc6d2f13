//! # Rate Limiter Module
//!
//! Admission control for incoming requests: a shared global bucket plus one
//! bucket per client identity.
//!
//! ## Module Structure
//!
//! ```text
//!     rate_limiter/
//!     ├── mod.rs          (You are here - Module organization)
//!     ├── admission.rs    (Global + per-identity policy, live reconfiguration)
//!     ├── registry.rs     (Sharded, bounded per-identity bucket map)
//!     ├── core.rs         (Lock-free token bucket)
//!     ├── config.rs       (Bucket parameters and validation)
//!     ├── metrics.rs      (Counters and health classification)
//!     └── utils.rs        (Monotonic clock helpers)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     Request (identity)
//!          │
//!          ▼
//!     ┌───────────┐
//!     │ Admission │ ◄── global first, then identity
//!     └─────┬─────┘
//!           │
//!           ▼
//!     ┌───────────┐
//!     │ Registry  │ ◄── lookup-or-create, idle sweep, bounded
//!     └─────┬─────┘
//!           │
//!           ▼
//!     ┌───────────┐
//!     │   Core    │ ◄── token bucket algorithm
//!     └───────────┘
//! ```

mod admission;
mod config;
mod core;
mod metrics;
mod registry;
mod utils;

/// Admission policy and its outcome
pub use admission::{Admission, Decision};

/// Bucket parameters
pub use config::BucketConfig;

/// Lock-free token bucket
pub use core::TokenBucket;

/// Per-identity bucket storage
pub use registry::{
    IdentityRegistry, RegistryStats, DEFAULT_IDLE_EVICTION_MS, DEFAULT_MAX_IDENTITIES,
    DEFAULT_SWEEP_INTERVAL_MS,
};

/// Counters and health
pub use metrics::{BucketMetrics, HealthStatus};

/// Monotonic clock helpers
pub use utils::{current_time_ms, current_time_us};
