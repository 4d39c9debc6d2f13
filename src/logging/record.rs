//! Log records and levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Severity of a [`LogRecord`], ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected that was handled.
    Warn,
    /// An operation failed.
    Error,
}

impl Level {
    /// Lowercase name, as written to the sink.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level `{0}`")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// One structured field: key and JSON value.
pub type Field = (String, Value);

/// Builds a [`Field`] from anything convertible to a JSON value.
///
/// ```rust
/// use tasker::field;
///
/// let (key, value) = field("task_id", "t-42");
/// assert_eq!(key, "task_id");
/// assert_eq!(value, "t-42");
/// ```
pub fn field(key: impl Into<String>, value: impl Into<Value>) -> Field {
    (key.into(), value.into())
}

/// A single application log entry.
///
/// Created by the caller and moved into the pipeline, which owns it until it
/// is written or dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Severity.
    pub level: Level,
    /// Human-readable message.
    pub message: String,
    /// Structured fields in insertion order.
    pub fields: Vec<Field>,
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
    /// Request correlation id, if the record belongs to a request.
    pub correlation_id: Option<String>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Appends a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(field(key, value));
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Looks up a field by key.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warn < Level::Error);
        assert_eq!(Level::Warn.max(Level::Info), Level::Warn);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("INFO".parse::<Level>().unwrap(), Level::Info);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert!("trace".parse::<Level>().is_err());
        assert_eq!(Level::Error.to_string(), "error");
    }

    #[test]
    fn test_record_builder() {
        let record = LogRecord::new(Level::Info, "task created")
            .with_field("task_id", "t-1")
            .with_field("attempt", 2)
            .with_correlation_id("req-9");

        assert_eq!(record.field("task_id"), Some(&json!("t-1")));
        assert_eq!(record.field("attempt"), Some(&json!(2)));
        assert_eq!(record.field("missing"), None);
        assert_eq!(record.correlation_id.as_deref(), Some("req-9"));
    }
}
