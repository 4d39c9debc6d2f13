//! # Async Log Pipeline
//!
//! Request threads hand records to a bounded queue and return at once; a
//! single writer thread batches them into the sink.
//!
//! ```text
//!     enqueue() ──try_send──► ┌──────────────────────┐
//!     enqueue() ──try_send──► │ bounded queue (FIFO) │──► writer thread
//!     enqueue() ──try_send──► └──────────────────────┘        │
//!         │ full or not running                               ▼
//!         ▼                                          batch ──► sink
//!     dropped += 1                        (full batch, timer tick, shutdown)
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!     Running ──shutdown()──► Draining ──writer drained + synced──► Stopped
//! ```
//!
//! Loss is preferred over blocking: a full queue drops the record, and a
//! failing sink is not retried. Every record accepted before shutdown is
//! written exactly once.

use super::record::{Level, LogRecord};
use super::sink::LogSink;
use crate::error::{ConfigError, StartError};
use crate::settings::LoggerSettings;
use crate::shutdown::{BackgroundThread, ShutdownListener, ShutdownSignal};
use crossbeam::channel::{self, select, Receiver, Sender, TrySendError};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue occupancy, in percent, above which a saturation warning is logged.
const SATURATION_PERCENT: usize = 90;

/// Pipeline parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Queue capacity.
    pub buffer_size: usize,
    /// Records per flush.
    pub batch_size: usize,
    /// Interval of the flush timer.
    pub flush_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&LoggerSettings::default())
    }
}

impl From<&LoggerSettings> for PipelineConfig {
    fn from(settings: &LoggerSettings) -> Self {
        Self {
            buffer_size: settings.buffer_size,
            batch_size: settings.batch_size,
            flush_delay: settings.flush_delay(),
        }
    }
}

impl PipelineConfig {
    /// Checks every value is usable.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("logger.buffer_size", "must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("logger.batch_size", "must be greater than 0"));
        }
        if self.flush_delay.is_zero() {
            return Err(ConfigError::invalid("logger.flush_delay_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Where the pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Accepting records.
    Running,
    /// Refusing records, writing out what is queued.
    Draining,
    /// Writer has exited and the sink is synced.
    Stopped,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Lifecycle state.
    pub state: PipelineState,
    /// Records accepted into the queue.
    pub enqueued: u64,
    /// Records refused (queue full or not running).
    pub dropped: u64,
    /// Records handed to the sink successfully.
    pub written: u64,
    /// Sink write or sync failures.
    pub write_errors: u64,
    /// Flushes triggered by a full batch.
    pub flushes_full: u64,
    /// Flushes triggered by the timer.
    pub flushes_timer: u64,
    /// Flushes during shutdown.
    pub flushes_final: u64,
    /// Saturation warnings the writer managed to queue.
    pub saturation_warnings: u64,
    /// Saturation warnings that found the queue full.
    pub saturation_warnings_dropped: u64,
    /// Records waiting in the queue.
    pub queue_len: usize,
    /// Queue capacity.
    pub queue_capacity: usize,
}

impl PipelineStats {
    /// Total flushes of any kind.
    pub fn flushes(&self) -> u64 {
        self.flushes_full + self.flushes_timer + self.flushes_final
    }
}

#[derive(Debug, Default)]
struct Counters {
    state: AtomicU8,
    enqueued: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    written: AtomicU64,
    write_errors: AtomicU64,
    flushes_full: AtomicU64,
    flushes_timer: AtomicU64,
    flushes_final: AtomicU64,
    saturation_warnings: AtomicU64,
    saturation_warnings_dropped: AtomicU64,
}

impl Counters {
    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn begin_draining(&self) {
        let _ = self.state.compare_exchange(
            PipelineState::Running as u8,
            PipelineState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn set_stopped(&self) {
        self.state.store(PipelineState::Stopped as u8, Ordering::Release);
    }
}

/// Bounded, batching, fire-and-forget log pipeline.
///
/// ```rust
/// use tasker::{AsyncLogPipeline, CaptureSink, Level, LogRecord, PipelineConfig};
///
/// let sink = CaptureSink::new();
/// let pipeline = AsyncLogPipeline::start(PipelineConfig::default(), sink.clone(), None).unwrap();
///
/// pipeline.enqueue(LogRecord::new(Level::Info, "hello"));
/// let stats = pipeline.shutdown();
///
/// assert_eq!(stats.written, 1);
/// assert_eq!(sink.records()[0].message, "hello");
/// ```
pub struct AsyncLogPipeline {
    sender: Sender<LogRecord>,
    /// Kept to sweep up records that raced past the writer's final drain.
    leftovers: Receiver<LogRecord>,
    counters: Arc<Counters>,
    capacity: usize,
    stop: ShutdownSignal,
    writer: Mutex<Option<BackgroundThread>>,
}

impl AsyncLogPipeline {
    /// Starts the writer thread.
    ///
    /// When `process_shutdown` fires the writer drains and exits on its own;
    /// [`shutdown`](Self::shutdown) still has to be called to wait for it.
    ///
    /// # Errors
    ///
    /// [`StartError::Config`] for an invalid configuration,
    /// [`StartError::Spawn`] if the writer thread cannot be created.
    pub fn start<S: LogSink>(
        config: PipelineConfig,
        sink: S,
        process_shutdown: Option<ShutdownListener>,
    ) -> Result<Self, StartError> {
        config.validate()?;

        let (sender, receiver) = channel::bounded(config.buffer_size);
        let counters = Arc::new(Counters::default());
        let stop = ShutdownSignal::new();

        let writer = Writer {
            records: receiver.clone(),
            warnings: sender.clone(),
            sink,
            batch: Vec::with_capacity(config.batch_size),
            counters: counters.clone(),
            batch_size: config.batch_size,
            capacity: config.buffer_size,
            saturated: false,
        };
        let stop_listener = stop.listener();
        let flush_delay = config.flush_delay;
        let thread = BackgroundThread::spawn("tasker-log-writer", move || {
            writer.run(flush_delay, stop_listener, process_shutdown)
        })?;

        info!(
            buffer_size = config.buffer_size,
            batch_size = config.batch_size,
            flush_delay_ms = config.flush_delay.as_millis() as u64,
            "log pipeline started"
        );

        Ok(Self {
            sender,
            leftovers: receiver,
            counters,
            capacity: config.buffer_size,
            stop,
            writer: Mutex::new(Some(thread)),
        })
    }

    /// Offers a record to the queue without blocking.
    ///
    /// Returns `false` if the record was dropped because the queue is full
    /// or the pipeline is shutting down. Each drop adds exactly one to the
    /// dropped counter.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        if self.counters.state() != PipelineState::Running {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Counted before the send so a concurrent leftover sweep never sees
        // a queued record that is not yet in `enqueued`.
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.enqueued.fetch_sub(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Records dropped so far.
    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.counters.state()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            state: c.state(),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
            flushes_full: c.flushes_full.load(Ordering::Relaxed),
            flushes_timer: c.flushes_timer.load(Ordering::Relaxed),
            flushes_final: c.flushes_final.load(Ordering::Relaxed),
            saturation_warnings: c.saturation_warnings.load(Ordering::Relaxed),
            saturation_warnings_dropped: c.saturation_warnings_dropped.load(Ordering::Relaxed),
            queue_len: self.sender.len(),
            queue_capacity: self.capacity,
        }
    }

    /// Stops accepting records, waits for the writer to drain and sync, and
    /// returns the final counters.
    ///
    /// Safe to call more than once; later calls return the same counters.
    pub fn shutdown(&self) -> PipelineStats {
        let mut writer = self.writer.lock();
        if let Some(thread) = writer.take() {
            self.counters.begin_draining();
            self.stop.trigger();
            thread.join();
            self.discard_leftovers();
            self.counters.set_stopped();
            let stats = self.stats();
            info!(
                written = stats.written,
                dropped = stats.dropped,
                write_errors = stats.write_errors,
                "log pipeline stopped"
            );
        }
        self.stats()
    }

    /// Like [`shutdown`](Self::shutdown) but waits at most `grace`.
    ///
    /// Returns `true` if the pipeline reached [`PipelineState::Stopped`].
    /// On timeout the writer keeps draining in the background.
    pub fn shutdown_within(&self, grace: Duration) -> bool {
        let mut writer = self.writer.lock();
        if let Some(thread) = writer.take() {
            self.counters.begin_draining();
            self.stop.trigger();
            if thread.join_within(grace) {
                self.discard_leftovers();
                self.counters.set_stopped();
            }
        }
        self.state() == PipelineState::Stopped
    }
}

impl AsyncLogPipeline {
    /// Moves records accepted after the writer's last drain from `enqueued`
    /// to `dropped`. Only valid once the writer has exited.
    fn discard_leftovers(&self) {
        let mut discarded = 0u64;
        while self.leftovers.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            self.counters.enqueued.fetch_sub(discarded, Ordering::Relaxed);
            self.counters.dropped.fetch_add(discarded, Ordering::Relaxed);
            debug!(discarded, "records arrived after the final drain");
        }
    }
}

impl Drop for AsyncLogPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AsyncLogPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLogPipeline")
            .field("state", &self.state())
            .field("queue_len", &self.sender.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum FlushCause {
    Full,
    Timer,
    Final,
}

/// State owned by the writer thread.
struct Writer<S: LogSink> {
    records: Receiver<LogRecord>,
    warnings: Sender<LogRecord>,
    sink: S,
    batch: Vec<LogRecord>,
    counters: Arc<Counters>,
    batch_size: usize,
    capacity: usize,
    saturated: bool,
}

impl<S: LogSink> Writer<S> {
    fn run(
        mut self,
        flush_delay: Duration,
        stop: ShutdownListener,
        process_shutdown: Option<ShutdownListener>,
    ) {
        let ticker = channel::tick(flush_delay);
        let never = channel::never();
        let records = self.records.clone();
        let process = process_shutdown
            .as_ref()
            .map(|listener| listener.receiver())
            .unwrap_or(&never);

        loop {
            select! {
                recv(records) -> msg => match msg {
                    Ok(record) => self.accept(record),
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if !self.batch.is_empty() {
                        self.flush(FlushCause::Timer);
                    }
                }
                recv(stop.receiver()) -> _ => break,
                recv(process) -> _ => break,
            }
        }

        self.counters.begin_draining();
        let mut drained = 0usize;
        while let Ok(record) = self.records.try_recv() {
            drained += 1;
            self.batch.push(record);
            if self.batch.len() >= self.batch_size {
                self.flush(FlushCause::Full);
            }
        }
        if !self.batch.is_empty() {
            self.flush(FlushCause::Final);
        }
        if let Err(err) = self.sink.sync() {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "log sink sync failed");
        }
        self.counters.set_stopped();
        debug!(drained, "log writer exited");
    }

    fn accept(&mut self, record: LogRecord) {
        self.batch.push(record);
        self.check_saturation();
        if self.batch.len() >= self.batch_size {
            self.flush(FlushCause::Full);
        }
    }

    /// Logs once each time occupancy crosses the threshold upward.
    fn check_saturation(&mut self) {
        let len = self.records.len();
        let above = len * 100 > self.capacity * SATURATION_PERCENT;
        if above && !self.saturated {
            warn!(len, capacity = self.capacity, "log queue above 90% capacity");
            let record = LogRecord::new(Level::Warn, "log buffer nearly full")
                .with_field("queue_len", len as u64)
                .with_field("capacity", self.capacity as u64);
            match self.warnings.try_send(record) {
                Ok(()) => self.counters.saturation_warnings.fetch_add(1, Ordering::Relaxed),
                Err(_) => self.counters.saturation_warnings_dropped.fetch_add(1, Ordering::Relaxed),
            };
        }
        self.saturated = above;
    }

    fn flush(&mut self, cause: FlushCause) {
        let counter = match cause {
            FlushCause::Full => &self.counters.flushes_full,
            FlushCause::Timer => &self.counters.flushes_timer,
            FlushCause::Final => &self.counters.flushes_final,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut written = 0u64;
        let mut failed = 0u64;
        for record in self.batch.drain(..) {
            match self.sink.write(&record) {
                Ok(()) => written += 1,
                Err(err) => {
                    // Remaining records in the batch are still attempted
                    if failed == 0 {
                        warn!(error = %err, "log sink write failed");
                    }
                    failed += 1;
                }
            }
        }
        self.counters.written.fetch_add(written, Ordering::Relaxed);
        if failed > 0 {
            self.counters.write_errors.fetch_add(failed, Ordering::Relaxed);
        }
        debug!(?cause, written, failed, "flushed log batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::sink::CaptureSink;
    use std::io;
    use std::thread;

    fn config(buffer_size: usize, batch_size: usize, flush_ms: u64) -> PipelineConfig {
        PipelineConfig {
            buffer_size,
            batch_size,
            flush_delay: Duration::from_millis(flush_ms),
        }
    }

    fn record(i: usize) -> LogRecord {
        LogRecord::new(Level::Info, format!("record {i}"))
    }

    /// Fails every write whose message ends in an odd digit.
    struct FlakySink {
        inner: CaptureSink,
    }

    impl LogSink for FlakySink {
        fn write(&mut self, record: &LogRecord) -> io::Result<()> {
            if record.message.ends_with(['1', '3', '5', '7', '9']) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.inner.write(record)
        }

        fn sync(&mut self) -> io::Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn test_invalid_config() {
        let result = AsyncLogPipeline::start(config(0, 1, 10), CaptureSink::new(), None);
        assert!(matches!(result, Err(StartError::Config(_))));
        let result = AsyncLogPipeline::start(config(10, 0, 10), CaptureSink::new(), None);
        assert!(matches!(result, Err(StartError::Config(_))));
    }

    #[test]
    fn test_full_batches_flush_before_timer() {
        let sink = CaptureSink::new();
        let pipeline = AsyncLogPipeline::start(config(1000, 10, 60_000), sink.clone(), None).unwrap();

        for i in 0..30 {
            assert!(pipeline.enqueue(record(i)));
        }
        thread::sleep(Duration::from_millis(200));

        assert_eq!(sink.len(), 30);
        let stats = pipeline.stats();
        assert_eq!(stats.flushes_full, 3);
        assert_eq!(stats.flushes_timer, 0);
        pipeline.shutdown();
    }

    #[test]
    fn test_timer_flushes_partial_batch() {
        let sink = CaptureSink::new();
        let pipeline = AsyncLogPipeline::start(config(100, 50, 30), sink.clone(), None).unwrap();

        pipeline.enqueue(record(0));
        pipeline.enqueue(record(1));
        thread::sleep(Duration::from_millis(200));

        assert_eq!(sink.len(), 2);
        assert!(pipeline.stats().flushes_timer >= 1);
        pipeline.shutdown();
    }

    #[test]
    fn test_order_preserved() {
        let sink = CaptureSink::new();
        let pipeline = AsyncLogPipeline::start(config(1000, 7, 20), sink.clone(), None).unwrap();
        for i in 0..100 {
            pipeline.enqueue(record(i));
        }
        pipeline.shutdown();

        let messages: Vec<_> = sink.records().into_iter().map(|r| r.message).collect();
        let expected: Vec<_> = (0..100).map(|i| format!("record {i}")).collect();
        assert_eq!(messages, expected);
    }

    #[test]
    fn test_shutdown_drains_and_is_idempotent() {
        let sink = CaptureSink::with_write_delay(Duration::from_millis(1));
        let pipeline = AsyncLogPipeline::start(config(500, 100, 60_000), sink.clone(), None).unwrap();
        for i in 0..200 {
            pipeline.enqueue(record(i));
        }

        let first = pipeline.shutdown();
        let second = pipeline.shutdown();

        assert_eq!(first.state, PipelineState::Stopped);
        assert_eq!(first, second);
        assert_eq!(first.written, first.enqueued + first.saturation_warnings);
        assert_eq!(sink.len() as u64, first.written);
        assert_eq!(sink.syncs(), 1);
    }

    #[test]
    fn test_enqueue_after_shutdown_drops() {
        let pipeline = AsyncLogPipeline::start(config(10, 5, 100), CaptureSink::new(), None).unwrap();
        pipeline.shutdown();

        assert!(!pipeline.enqueue(record(0)));
        assert!(!pipeline.enqueue(record(1)));
        assert_eq!(pipeline.dropped_count(), 2);
    }

    #[test]
    fn test_record_accepted_after_final_drain_counts_as_dropped() {
        let sink = CaptureSink::new();
        let pipeline = AsyncLogPipeline::start(config(10, 5, 100), sink.clone(), None).unwrap();
        pipeline.shutdown();

        // Replays an enqueue that read the state just before the writer stopped
        pipeline
            .counters
            .state
            .store(PipelineState::Running as u8, Ordering::Release);
        assert!(pipeline.enqueue(record(0)));
        pipeline.discard_leftovers();
        pipeline.counters.set_stopped();

        let stats = pipeline.stats();
        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.queue_len, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let sink = CaptureSink::with_write_delay(Duration::from_millis(20));
        let pipeline = AsyncLogPipeline::start(config(5, 1, 1000), sink.clone(), None).unwrap();

        let start = std::time::Instant::now();
        let accepted = (0..50).filter(|&i| pipeline.enqueue(record(i))).count() as u64;
        assert!(start.elapsed() < Duration::from_millis(500));

        let stats = pipeline.stats();
        assert!(stats.dropped > 0);
        assert_eq!(accepted + stats.dropped, 50);
        pipeline.shutdown_within(Duration::from_secs(10));
    }

    #[test]
    fn test_sink_errors_counted_and_skipped() {
        let inner = CaptureSink::new();
        let pipeline = AsyncLogPipeline::start(config(100, 4, 1000), FlakySink { inner: inner.clone() }, None).unwrap();
        for i in 0..10 {
            pipeline.enqueue(record(i));
        }
        let stats = pipeline.shutdown();

        assert_eq!(stats.written, 5);
        assert_eq!(stats.write_errors, 5);
        assert_eq!(inner.len(), 5);
    }

    #[test]
    fn test_saturation_warning_offered() {
        let sink = CaptureSink::with_write_delay(Duration::from_millis(5));
        let pipeline = AsyncLogPipeline::start(config(20, 1, 1000), sink.clone(), None).unwrap();
        for i in 0..40 {
            pipeline.enqueue(record(i));
        }
        pipeline.shutdown();

        let stats = pipeline.stats();
        assert_eq!(stats.written, stats.enqueued + stats.saturation_warnings);
        // The warning goes through the same queue, so it may itself be dropped
        assert!(stats.saturation_warnings + stats.saturation_warnings_dropped >= 1);
        let warned = sink.records().iter().filter(|r| r.level == Level::Warn).count() as u64;
        assert_eq!(warned, stats.saturation_warnings);
    }

    #[test]
    fn test_process_shutdown_stops_writer() {
        let signal = ShutdownSignal::new();
        let sink = CaptureSink::new();
        let pipeline = AsyncLogPipeline::start(config(100, 50, 60_000), sink.clone(), Some(signal.listener())).unwrap();
        pipeline.enqueue(record(0));

        signal.trigger();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(sink.len(), 1);
        assert!(pipeline.shutdown_within(Duration::from_secs(1)));
    }
}
