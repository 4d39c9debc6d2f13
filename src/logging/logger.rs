//! The application-facing logging handle.

use super::pipeline::AsyncLogPipeline;
use super::record::{Field, Level, LogRecord};
use std::fmt;
use std::sync::Arc;

/// Cheap-to-clone handle that stamps records and hands them to the pipeline.
///
/// Records below the minimum level are discarded before they reach the queue
/// and do not count as dropped.
///
/// ```rust
/// use std::sync::Arc;
/// use tasker::{field, AsyncLogPipeline, CaptureSink, Level, Logger, PipelineConfig};
///
/// let sink = CaptureSink::new();
/// let pipeline = Arc::new(AsyncLogPipeline::start(PipelineConfig::default(), sink.clone(), None).unwrap());
/// let logger = Logger::new(pipeline.clone(), Level::Info).with_correlation_id("req-1");
///
/// logger.debug("ignored", vec![]);
/// logger.info("task created", vec![field("task_id", "t-1")]);
/// pipeline.shutdown();
///
/// let records = sink.records();
/// assert_eq!(records.len(), 1);
/// assert_eq!(records[0].correlation_id.as_deref(), Some("req-1"));
/// ```
#[derive(Clone)]
pub struct Logger {
    pipeline: Option<Arc<AsyncLogPipeline>>,
    min_level: Level,
    fields: Arc<Vec<Field>>,
    correlation_id: Option<Arc<str>>,
}

impl Logger {
    /// Logger writing to `pipeline` at `min_level` and above.
    pub fn new(pipeline: Arc<AsyncLogPipeline>, min_level: Level) -> Self {
        Self {
            pipeline: Some(pipeline),
            min_level,
            fields: Arc::new(Vec::new()),
            correlation_id: None,
        }
    }

    /// Logger that discards everything.
    pub fn disabled() -> Self {
        Self {
            pipeline: None,
            min_level: Level::Error,
            fields: Arc::new(Vec::new()),
            correlation_id: None,
        }
    }

    /// Returns a logger that adds `fields` to every record.
    pub fn with_fields(&self, fields: Vec<Field>) -> Self {
        let mut merged = Vec::with_capacity(self.fields.len() + fields.len());
        merged.extend(self.fields.iter().cloned());
        merged.extend(fields);
        Self {
            fields: Arc::new(merged),
            ..self.clone()
        }
    }

    /// Returns a logger that tags every record with `id`.
    pub fn with_correlation_id(&self, id: impl Into<String>) -> Self {
        let id: String = id.into();
        Self {
            correlation_id: Some(Arc::from(id)),
            ..self.clone()
        }
    }

    /// Returns a logger tagged with a fresh random correlation id.
    pub fn for_request(&self) -> Self {
        self.with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    /// `true` if a record at `level` would be enqueued.
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        self.pipeline.is_some() && level >= self.min_level
    }

    /// Enqueues a record without blocking.
    ///
    /// Returns `false` if the record was filtered out or dropped.
    pub fn log(&self, level: Level, message: impl Into<String>, fields: Vec<Field>) -> bool {
        let Some(pipeline) = &self.pipeline else {
            return false;
        };
        if level < self.min_level {
            return false;
        }

        let mut record = LogRecord::new(level, message);
        if !self.fields.is_empty() {
            record.fields.extend(self.fields.iter().cloned());
        }
        record.fields.extend(fields);
        record.correlation_id = self.correlation_id.as_deref().map(str::to_owned);
        pipeline.enqueue(record)
    }

    /// Logs at [`Level::Debug`].
    pub fn debug(&self, message: impl Into<String>, fields: Vec<Field>) -> bool {
        self.log(Level::Debug, message, fields)
    }

    /// Logs at [`Level::Info`].
    pub fn info(&self, message: impl Into<String>, fields: Vec<Field>) -> bool {
        self.log(Level::Info, message, fields)
    }

    /// Logs at [`Level::Warn`].
    pub fn warn(&self, message: impl Into<String>, fields: Vec<Field>) -> bool {
        self.log(Level::Warn, message, fields)
    }

    /// Logs at [`Level::Error`].
    pub fn error(&self, message: impl Into<String>, fields: Vec<Field>) -> bool {
        self.log(Level::Error, message, fields)
    }

    /// Records dropped by the pipeline so far, 0 when disabled.
    pub fn dropped_count(&self) -> u64 {
        self.pipeline.as_ref().map_or(0, |p| p.dropped_count())
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("enabled", &self.pipeline.is_some())
            .field("min_level", &self.min_level)
            .field("fields", &self.fields.len())
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::pipeline::PipelineConfig;
    use crate::logging::record::field;
    use crate::logging::sink::CaptureSink;
    use serde_json::json;

    fn logger(level: Level) -> (Logger, Arc<AsyncLogPipeline>, CaptureSink) {
        let sink = CaptureSink::new();
        let pipeline = Arc::new(AsyncLogPipeline::start(PipelineConfig::default(), sink.clone(), None).unwrap());
        (Logger::new(pipeline.clone(), level), pipeline, sink)
    }

    #[test]
    fn test_level_filter_does_not_count_as_dropped() {
        let (logger, pipeline, sink) = logger(Level::Warn);

        assert!(!logger.info("below", vec![]));
        assert!(logger.warn("at", vec![]));
        assert!(logger.error("above", vec![]));
        pipeline.shutdown();

        assert_eq!(sink.len(), 2);
        assert_eq!(logger.dropped_count(), 0);
    }

    #[test]
    fn test_default_fields_come_first() {
        let (logger, pipeline, sink) = logger(Level::Debug);
        let scoped = logger
            .with_fields(vec![field("component", "worker")])
            .with_fields(vec![field("shard", 3)]);

        scoped.debug("tick", vec![field("n", 1)]);
        pipeline.shutdown();

        let record = &sink.records()[0];
        let keys: Vec<_> = record.fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["component", "shard", "n"]);
        assert_eq!(record.field("shard"), Some(&json!(3)));
    }

    #[test]
    fn test_correlation_id() {
        let (logger, pipeline, sink) = logger(Level::Info);
        logger.info("no id", vec![]);
        let request = logger.for_request();
        request.info("with id", vec![]);
        pipeline.shutdown();

        let records = sink.records();
        assert!(records[0].correlation_id.is_none());
        let id = records[1].correlation_id.as_deref().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_disabled_logger() {
        let logger = Logger::disabled();
        assert!(!logger.enabled(Level::Error));
        assert!(!logger.error("nowhere", vec![]));
        assert_eq!(logger.dropped_count(), 0);
    }

    #[test]
    fn test_drops_after_shutdown_are_counted() {
        let (logger, pipeline, _sink) = logger(Level::Info);
        pipeline.shutdown();
        assert!(!logger.info("late", vec![]));
        assert_eq!(logger.dropped_count(), 1);
    }
}
