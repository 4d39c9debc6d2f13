//! # Task Completion Worker
//!
//! Completes tasks that have sat unfinished for too long.
//!
//! ```text
//!     every scan interval                       one at a time
//!     ┌─────────┐  try_send   ┌───────────┐  recv  ┌───────────┐
//!     │ scanner ├────────────►│ queue(100)├───────►│ processor │
//!     └────┬────┘             └───────────┘        └─────┬─────┘
//!          │ stale_pending()                             │ complete_if_pending()
//!          ▼                                             ▼
//!     ┌──────────────────────── TaskStore ───────────────────────┐
//!     └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage is the source of truth. A task skipped because the queue was
//! full, or abandoned in the queue at shutdown, is found again by the next
//! scan, so nothing here retries.

use super::store::{CompletionOutcome, TaskId, TaskStore};
use crate::error::{SpawnError, StoreError};
use crate::logging::{field, Logger};
use crate::settings::SettingsSource;
use crate::shutdown::{BackgroundThread, ShutdownListener, ShutdownSignal};
use crossbeam::channel::{self, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Capacity of the queue between scanner and processor.
pub const TASK_QUEUE_CAPACITY: usize = 100;

/// Counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Scans run.
    pub scans: u64,
    /// Scans abandoned because the store failed.
    pub scan_failures: u64,
    /// Ids handed to the processor.
    pub queued: u64,
    /// Ids skipped because the queue was full.
    pub skipped: u64,
    /// Tasks this worker completed.
    pub completed: u64,
    /// Tasks someone else settled first.
    pub already_settled: u64,
    /// Completions that failed in the store.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scans: AtomicU64,
    scan_failures: AtomicU64,
    queued: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    already_settled: AtomicU64,
    failed: AtomicU64,
}

/// What one scan found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Stale tasks returned by the store.
    pub found: usize,
    /// Ids pushed onto the queue.
    pub queued: usize,
    /// Ids skipped because the queue was full.
    pub skipped: usize,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    settings: Arc<dyn SettingsSource>,
    logger: Logger,
    counters: Counters,
    sender: Sender<TaskId>,
    receiver: Receiver<TaskId>,
}

/// Background scanner plus processor.
///
/// ```rust
/// use std::sync::Arc;
/// use tasker::{LiveSettings, Logger, MemoryTaskStore, TaskCompletionWorker};
///
/// let store = Arc::new(MemoryTaskStore::new());
/// let id = store.create("stale");
/// let worker = TaskCompletionWorker::new(store.clone(), Arc::new(LiveSettings::default()), Logger::disabled());
///
/// worker.process_task(&id).unwrap();
/// assert_eq!(worker.stats().completed, 1);
/// ```
pub struct TaskCompletionWorker {
    inner: Arc<Inner>,
    stop: ShutdownSignal,
    threads: Mutex<Vec<BackgroundThread>>,
}

impl TaskCompletionWorker {
    /// Creates a stopped worker.
    pub fn new(
        store: Arc<dyn TaskStore>,
        settings: Arc<dyn SettingsSource>,
        logger: Logger,
    ) -> Self {
        let (sender, receiver) = channel::bounded(TASK_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                settings,
                logger: logger.with_fields(vec![field("component", "task_worker")]),
                counters: Counters::default(),
                sender,
                receiver,
            }),
            stop: ShutdownSignal::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Starts the scanner and processor threads.
    ///
    /// Both exit when `shutdown` fires or [`shutdown`](Self::shutdown) is
    /// called. Starting twice is a no-op, and so is starting a worker that
    /// was already shut down.
    ///
    /// # Errors
    ///
    /// [`SpawnError`] if either thread cannot be created. A processor that
    /// did start is stopped again.
    pub fn start(&self, shutdown: &ShutdownListener) -> Result<(), SpawnError> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        if self.stop.is_triggered() || shutdown.is_shutdown() {
            debug!("task completion worker already stopped, not starting");
            return Ok(());
        }

        let processor = {
            let inner = self.inner.clone();
            let process = shutdown.clone();
            let stop = self.stop.listener();
            BackgroundThread::spawn("tasker-task-processor", move || inner.run_processor(process, stop))?
        };
        let scanner = {
            let inner = self.inner.clone();
            let process = shutdown.clone();
            let stop = self.stop.listener();
            BackgroundThread::spawn("tasker-task-scanner", move || inner.run_scanner(process, stop))
        };
        let scanner = match scanner {
            Ok(scanner) => scanner,
            Err(err) => {
                self.stop.trigger();
                processor.join();
                return Err(err);
            }
        };

        threads.push(scanner);
        threads.push(processor);
        info!("task completion worker started");
        Ok(())
    }

    /// Runs one scan immediately, regardless of the timer.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the store query fails; nothing is queued then.
    pub fn scan_once(&self) -> Result<ScanReport, StoreError> {
        self.inner.scan()
    }

    /// Completes one task if it is still open.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the update fails.
    pub fn process_task(&self, id: &TaskId) -> Result<CompletionOutcome, StoreError> {
        self.inner.process(id)
    }

    /// Ids waiting for the processor.
    pub fn queued_len(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Counters snapshot.
    pub fn stats(&self) -> WorkerStats {
        let c = &self.inner.counters;
        WorkerStats {
            scans: c.scans.load(Ordering::Relaxed),
            scan_failures: c.scan_failures.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            already_settled: c.already_settled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops both loops and waits up to `grace` in total for them.
    ///
    /// Ids still queued are abandoned. Returns `true` if every thread exited
    /// in time. Safe to call more than once.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.stop.trigger();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let deadline = Instant::now() + grace;

        let mut clean = true;
        for thread in threads {
            let remaining = deadline.saturating_duration_since(Instant::now());
            clean &= thread.join_within(remaining);
        }
        if clean {
            debug!("task completion worker stopped");
        }
        clean
    }
}

impl Drop for TaskCompletionWorker {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

impl fmt::Debug for TaskCompletionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompletionWorker")
            .field("running", &!self.threads.lock().is_empty())
            .field("queued", &self.queued_len())
            .finish()
    }
}

impl Inner {
    fn run_scanner(&self, process: ShutdownListener, stop: ShutdownListener) {
        loop {
            let interval = self.settings.current().worker.scan_interval();
            select! {
                recv(process.receiver()) -> _ => break,
                recv(stop.receiver()) -> _ => break,
                default(interval) => {
                    // Errors are logged inside; the next tick retries
                    let _ = self.scan();
                }
            }
        }
        debug!("task scanner exited");
    }

    fn run_processor(&self, process: ShutdownListener, stop: ShutdownListener) {
        loop {
            select! {
                recv(process.receiver()) -> _ => break,
                recv(stop.receiver()) -> _ => break,
                recv(self.receiver) -> msg => match msg {
                    Ok(id) => {
                        let _ = self.process(&id);
                    }
                    Err(_) => break,
                },
            }
        }
        debug!("task processor exited");
    }

    fn scan(&self) -> Result<ScanReport, StoreError> {
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        let age = self.settings.current().auto_complete_after();

        let ids = match self.store.stale_pending(age) {
            Ok(ids) => ids,
            Err(err) => {
                self.counters.scan_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "stale task scan failed");
                self.logger.error(
                    "failed to fetch pending tasks",
                    vec![field("error", err.to_string())],
                );
                return Err(err);
            }
        };

        let mut report = ScanReport {
            found: ids.len(),
            ..ScanReport::default()
        };
        for id in ids {
            match self.sender.try_send(id) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(id)) | Err(TrySendError::Disconnected(id)) => {
                    report.skipped += 1;
                    self.logger.error(
                        "task queue full, skipping task",
                        vec![field("task_id", id.as_str())],
                    );
                }
            }
        }

        self.counters.queued.fetch_add(report.queued as u64, Ordering::Relaxed);
        self.counters.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        if report.skipped > 0 {
            warn!(skipped = report.skipped, "task queue full during scan");
        }
        debug!(found = report.found, queued = report.queued, "stale task scan finished");
        Ok(report)
    }

    fn process(&self, id: &TaskId) -> Result<CompletionOutcome, StoreError> {
        match self.store.complete_if_pending(id) {
            Ok(CompletionOutcome::Completed) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.logger.info("auto-completed task", vec![field("task_id", id.as_str())]);
                Ok(CompletionOutcome::Completed)
            }
            Ok(CompletionOutcome::AlreadySettled) => {
                self.counters.already_settled.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %id, "task already settled");
                Ok(CompletionOutcome::AlreadySettled)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.logger.error(
                    "failed to auto-complete task",
                    vec![field("task_id", id.as_str()), field("error", err.to_string())],
                );
                Err(err)
            }
        }
    }
}
