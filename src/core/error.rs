use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::types::ResourceKind;
use super::value::DecodeError;

/// Status reported by the backing store for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl<T> From<std::sync::PoisonError<T>> for BackendError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("lock poisoned: {}", err))
    }
}

/// Caller-supplied input that was rejected before reaching the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidInput {
    #[error(
        "invalid key '{0}': expected a UUID like '550e8400-e29b-41d4-a716-446655440000'"
    )]
    MalformedKey(String),

    #[error("sort must be one of: {accepted}, got '{got}'")]
    UnknownSort { got: String, accepted: String },

    #[error("{param} must be a non-negative integer, got '{value}'")]
    NegativePagination { param: &'static str, value: String },

    #[error("{param} must be an integer between 0 and {max}, got '{value}'")]
    MalformedPagination {
        param: &'static str,
        value: String,
        max: u32,
    },

    #[error("malformed JSON payload: {0}")]
    MalformedJson(String),
}

/// Startup failure. The service must not serve requests after one of these.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid provisioning target: {0}")]
    InvalidTarget(String),

    #[error("failed to check {kind} '{name}': {source}")]
    Check {
        kind: ResourceKind,
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to create {kind} '{name}': {source}")]
    Create {
        kind: ResourceKind,
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("provisioning {kind} '{name}' timed out after {after:?}")]
    Timeout {
        kind: ResourceKind,
        name: String,
        after: Duration,
    },

    #[error("failed to open backing store: {0}")]
    Connect(#[source] BackendError),
}

impl ProvisionError {
    /// Resource the failure belongs to, if it happened at a provisioning step.
    pub fn resource(&self) -> Option<ResourceKind> {
        match self {
            Self::Check { kind, .. } | Self::Create { kind, .. } | Self::Timeout { kind, .. } => {
                Some(*kind)
            }
            Self::InvalidTarget(_) | Self::Connect(_) => None,
        }
    }
}

/// Failure of a single-record operation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backing store error: {0}")]
    Backend(#[from] BackendError),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] DecodeError),
}

/// Which half of a list call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Snapshot,
    Fetch,
    Count,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => write!(f, "snapshot"),
            Self::Fetch => write!(f, "fetch"),
            Self::Count => write!(f, "count"),
        }
    }
}

/// Failure of a list call. Never accompanied by a partial result.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),

    #[error("backing store error during {phase}: {source}")]
    Backend {
        phase: QueryPhase,
        #[source]
        source: BackendError,
    },

    #[error("list query timed out after {0:?}")]
    Timeout(Duration),

    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The caller sent something unusable.
    Client,
    /// The store or the service failed.
    Server,
}

/// Error returned at the operation boundary of [`crate::KvService`].
#[derive(Error, Debug)]
pub enum KvError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(QueryError),
}

impl From<QueryError> for KvError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidInput(input) => Self::InvalidInput(input),
            other => Self::Query(other),
        }
    }
}

impl KvError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidInput(_) => ErrorCategory::Client,
            Self::Store(_) | Self::Query(_) => ErrorCategory::Server,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Timeout(_)) | Self::Query(QueryError::Timeout(_))
        )
    }
}
