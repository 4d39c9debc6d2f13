//! # Worker Module
//!
//! ```text
//!     worker/
//!     ├── mod.rs          (You are here)
//!     ├── completion.rs   (Scanner + processor threads)
//!     └── store.rs        (TaskStore trait, in-memory store, task types)
//! ```

mod completion;
mod store;

pub use completion::{ScanReport, TaskCompletionWorker, WorkerStats, TASK_QUEUE_CAPACITY};
pub use store::{CompletionOutcome, MemoryTaskStore, Task, TaskId, TaskStatus, TaskStore};
