use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::error::{BackendError, BackendResult};

/// A single cell value exchanged with the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    String(String),
    Json(JsonValue),
    Timestamp(DateTime<Utc>),
    /// Placeholder replaced by the transaction's commit timestamp on write.
    CommitTimestamp,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOL",
            Self::Int64(_) => "INT64",
            Self::String(_) => "STRING",
            Self::Json(_) => "JSON",
            Self::Timestamp(_) => "TIMESTAMP",
            Self::CommitTimestamp => "PENDING_COMMIT_TIMESTAMP",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Ordering used by ORDER BY. NULL sorts before every other value.
    pub fn compare(&self, other: &Value) -> BackendResult<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Ok(Ordering::Equal),
            (Self::Null, _) => Ok(Ordering::Less),
            (_, Self::Null) => Ok(Ordering::Greater),

            (Self::Bool(a), Self::Bool(b)) => Ok(a.cmp(b)),
            (Self::Int64(a), Self::Int64(b)) => Ok(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Ok(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Ok(a.cmp(b)),

            _ => Err(BackendError::InvalidArgument(format!(
                "cannot order {} against {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int64(i) => write!(f, "{}", i),
            Self::String(s) => write!(f, "{}", s),
            Self::Json(json) => write!(f, "{}", json),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::CommitTimestamp => write!(f, "PENDING_COMMIT_TIMESTAMP()"),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int64(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        Self::Json(json)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

/// A stored row could not be decoded into the expected shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("column '{column}': {reason}")]
pub struct DecodeError {
    pub column: String,
    pub reason: String,
}

impl DecodeError {
    fn new(column: &str, reason: impl Into<String>) -> Self {
        Self {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}

/// One result row: column names shared across the result set plus values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|idx| &self.values[idx])
    }

    fn require(&self, column: &str) -> Result<&Value, DecodeError> {
        self.get(column)
            .ok_or_else(|| DecodeError::new(column, "column missing from result"))
    }

    pub fn string(&self, column: &str) -> Result<&str, DecodeError> {
        let value = self.require(column)?;
        value
            .as_str()
            .ok_or_else(|| DecodeError::new(column, format!("expected STRING, got {}", value.type_name())))
    }

    pub fn int64(&self, column: &str) -> Result<i64, DecodeError> {
        let value = self.require(column)?;
        value
            .as_i64()
            .ok_or_else(|| DecodeError::new(column, format!("expected INT64, got {}", value.type_name())))
    }

    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, DecodeError> {
        let value = self.require(column)?;
        value.as_timestamp().ok_or_else(|| {
            DecodeError::new(column, format!("expected TIMESTAMP, got {}", value.type_name()))
        })
    }

    pub fn json(&self, column: &str) -> Result<&JsonValue, DecodeError> {
        let value = self.require(column)?;
        value
            .as_json()
            .ok_or_else(|| DecodeError::new(column, format!("expected JSON, got {}", value.type_name())))
    }
}
