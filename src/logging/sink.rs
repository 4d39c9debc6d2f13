//! # Log Sinks
//!
//! Where flushed batches end up. The writer thread owns its sink outright,
//! so implementations need `Send` but never `Sync`.

use super::record::LogRecord;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

/// Destination for log records.
pub trait LogSink: Send + 'static {
    /// Writes one record. May buffer.
    fn write(&mut self, record: &LogRecord) -> io::Result<()>;

    /// Pushes anything buffered to durable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl LogSink for Box<dyn LogSink> {
    fn write(&mut self, record: &LogRecord) -> io::Result<()> {
        (**self).write(record)
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }
}

/// Renders a record as a JSON object.
///
/// Keys: `timestamp` (RFC 3339), `level`, `msg`, `request_id` when set, then
/// every field. A field named like a reserved key is overridden.
pub fn to_json(record: &LogRecord) -> Value {
    let mut object = Map::with_capacity(record.fields.len() + 4);
    for (key, value) in &record.fields {
        object.insert(key.clone(), value.clone());
    }
    object.insert("timestamp".into(), Value::String(record.timestamp.to_rfc3339()));
    object.insert("level".into(), Value::String(record.level.as_str().into()));
    object.insert("msg".into(), Value::String(record.message.clone()));
    if let Some(id) = &record.correlation_id {
        object.insert("request_id".into(), Value::String(id.clone()));
    }
    Value::Object(object)
}

/// Writes one JSON object per line.
///
/// ```rust
/// use tasker::{JsonLinesSink, Level, LogRecord, LogSink};
///
/// let mut sink = JsonLinesSink::new(Vec::new());
/// sink.write(&LogRecord::new(Level::Info, "hello")).unwrap();
/// let bytes = sink.into_inner().unwrap();
/// assert!(String::from_utf8(bytes).unwrap().contains("\"msg\":\"hello\""));
/// ```
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send + 'static> {
    writer: BufWriter<W>,
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    /// Wraps `writer` in a buffer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Flushes and returns the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns the flush error if buffered data could not be written.
    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|err| err.into_error())
    }
}

impl JsonLinesSink<io::Stdout> {
    /// Sink writing to standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send + 'static> LogSink for JsonLinesSink<W> {
    fn write(&mut self, record: &LogRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, &to_json(record))?;
        self.writer.write_all(b"\n")
    }

    fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Keeps records in memory, optionally slowing every write down.
///
/// Clones share the same storage, so a test can hand one clone to the
/// pipeline and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
    syncs: Arc<Mutex<usize>>,
    write_delay: Option<Duration>,
}

impl CaptureSink {
    /// An instant sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that sleeps `delay` on every write.
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Copy of every record written so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Number of records written so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `sync` calls.
    pub fn syncs(&self) -> usize {
        *self.syncs.lock()
    }
}

impl LogSink for CaptureSink {
    fn write(&mut self, record: &LogRecord) -> io::Result<()> {
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        *self.syncs.lock() += 1;
        Ok(())
    }
}
