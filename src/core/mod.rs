pub mod deadline;
pub mod error;
pub mod types;
pub mod value;

pub use error::{
    BackendError, BackendResult, ErrorCategory, InvalidInput, KvError, ProvisionError, QueryError,
    QueryPhase, StoreError,
};
pub use types::{
    DatabasePath, HealthStatus, ProvisionOutcome, ProvisionReport, ProvisionTarget, Record,
    RecordKey, ResourceKind, KEY_LENGTH,
};
pub use value::{DecodeError, Row, Value};
