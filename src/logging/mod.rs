//! # Logging Module
//!
//! The application's own log path, separate from the crate's `tracing`
//! diagnostics.
//!
//! ```text
//!     logging/
//!     ├── mod.rs          (You are here)
//!     ├── record.rs       (Level, LogRecord, fields)
//!     ├── logger.rs       (Logger facade: level filter, default fields, request id)
//!     ├── pipeline.rs     (Bounded queue, batching writer thread, shutdown)
//!     └── sink.rs         (LogSink trait, JSON lines, in-memory capture)
//! ```

mod logger;
mod pipeline;
mod record;
mod sink;

pub use logger::Logger;
pub use pipeline::{AsyncLogPipeline, PipelineConfig, PipelineState, PipelineStats};
pub use record::{field, Field, Level, LogRecord, ParseLevelError};
pub use sink::{to_json, CaptureSink, JsonLinesSink, LogSink};
