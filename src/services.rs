//! # Service Wiring
//!
//! Starts every background component against one shutdown signal and stops
//! them in dependency order.
//!
//! ```text
//!     Services::start
//!       ├─ log pipeline   (writer thread)
//!       ├─ admission      (registry sweeper thread)
//!       └─ worker         (scanner + processor threads)
//!
//!     Services::shutdown(grace)
//!       1. trigger the shared signal     every loop wakes
//!       2. join worker threads           they may still log
//!       3. join the sweeper
//!       4. drain the log pipeline        last, so the lines above are written
//! ```

use crate::error::StartError;
use crate::logging::{field, AsyncLogPipeline, LogSink, Logger, PipelineConfig, PipelineStats};
use crate::rate_limiter::Admission;
use crate::settings::SettingsSource;
use crate::shutdown::{BackgroundThread, ShutdownSignal};
use crate::worker::{TaskCompletionWorker, TaskStore, WorkerStats};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What happened during [`Services::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Scanner and processor exited within the grace period.
    pub worker_stopped: bool,
    /// Registry sweeper exited within the grace period.
    pub sweeper_stopped: bool,
    /// Log pipeline drained and synced within the grace period.
    pub pipeline_stopped: bool,
    /// Final pipeline counters.
    pub pipeline: PipelineStats,
    /// Final worker counters.
    pub worker: WorkerStats,
}

impl ShutdownReport {
    /// Every component stopped in time.
    pub fn is_clean(&self) -> bool {
        self.worker_stopped && self.sweeper_stopped && self.pipeline_stopped
    }
}

/// The running background layer.
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tasker::{CaptureSink, LiveSettings, MemoryTaskStore, Services};
///
/// let services = Services::start(
///     Arc::new(LiveSettings::default()),
///     Arc::new(MemoryTaskStore::new()),
///     CaptureSink::new(),
/// )
/// .unwrap();
///
/// assert!(services.admission().allow("10.0.0.1").is_admitted());
/// assert!(services.shutdown(Duration::from_secs(5)).is_clean());
/// ```
pub struct Services {
    signal: ShutdownSignal,
    admission: Arc<Admission>,
    pipeline: Arc<AsyncLogPipeline>,
    logger: Logger,
    worker: TaskCompletionWorker,
    sweeper: Mutex<Option<BackgroundThread>>,
    report: Mutex<Option<ShutdownReport>>,
}

impl Services {
    /// Starts the log pipeline, admission sweeper and completion worker.
    ///
    /// # Errors
    ///
    /// [`StartError::Config`] if the current settings are invalid,
    /// [`StartError::Spawn`] if a thread cannot be started. Anything already
    /// running is signalled to stop.
    pub fn start<S: LogSink>(
        settings: Arc<dyn SettingsSource>,
        store: Arc<dyn TaskStore>,
        sink: S,
    ) -> Result<Self, StartError> {
        let signal = ShutdownSignal::new();
        match Self::assemble(settings, store, sink, &signal) {
            Ok(services) => Ok(services),
            Err(err) => {
                signal.trigger();
                Err(err)
            }
        }
    }

    fn assemble<S: LogSink>(
        settings: Arc<dyn SettingsSource>,
        store: Arc<dyn TaskStore>,
        sink: S,
        signal: &ShutdownSignal,
    ) -> Result<Self, StartError> {
        let current = settings.current();
        current.validate()?;

        // Not tied to the signal: the pipeline drains only after the worker
        // and sweeper are joined, so their last lines still get written.
        let pipeline = Arc::new(AsyncLogPipeline::start(
            PipelineConfig::from(&current.logger),
            sink,
            None,
        )?);
        let logger = Logger::new(pipeline.clone(), current.logger.level);

        let admission = Arc::new(Admission::from_source(settings.clone())?);
        let sweeper = admission.start_sweeper(signal.listener())?;

        let worker = TaskCompletionWorker::new(store, settings, logger.clone());
        if let Err(err) = worker.start(&signal.listener()) {
            signal.trigger();
            sweeper.join();
            return Err(err.into());
        }

        logger.info(
            "background services started",
            vec![
                field("version", crate::VERSION),
                field("auto_complete_minutes", current.auto_complete_minutes),
            ],
        );
        info!("background services started");

        Ok(Self {
            signal: signal.clone(),
            admission,
            pipeline,
            logger,
            worker,
            sweeper: Mutex::new(Some(sweeper)),
            report: Mutex::new(None),
        })
    }

    /// Admission controller for request handlers.
    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    /// Application logger.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// The log pipeline behind [`logger`](Self::logger).
    pub fn pipeline(&self) -> &Arc<AsyncLogPipeline> {
        &self.pipeline
    }

    /// The completion worker.
    pub fn worker(&self) -> &TaskCompletionWorker {
        &self.worker
    }

    /// The shared shutdown signal.
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Stops everything, waiting at most `grace` in total.
    ///
    /// Later calls return the first report without doing anything.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut report = self.report.lock();
        if let Some(report) = report.as_ref() {
            return report.clone();
        }

        let deadline = Instant::now() + grace;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        self.logger.info("shutting down background services", vec![]);
        self.signal.trigger();

        let worker_stopped = self.worker.shutdown(remaining());
        let sweeper_stopped = match self.sweeper.lock().take() {
            Some(sweeper) => sweeper.join_within(remaining()),
            None => true,
        };
        let pipeline_stopped = self.pipeline.shutdown_within(remaining());

        let result = ShutdownReport {
            worker_stopped,
            sweeper_stopped,
            pipeline_stopped,
            pipeline: self.pipeline.stats(),
            worker: self.worker.stats(),
        };
        if result.is_clean() {
            info!(
                written = result.pipeline.written,
                dropped = result.pipeline.dropped,
                completed = result.worker.completed,
                "background services stopped"
            );
        } else {
            warn!(?grace, "background services did not stop cleanly");
        }

        *report = Some(result.clone());
        result
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.signal.trigger();
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("shutdown", &self.signal.is_triggered())
            .field("admission", &self.admission)
            .field("pipeline", &self.pipeline)
            .field("worker", &self.worker)
            .finish()
    }
}
