//! Seam between the service core and the strongly-consistent backing store.
//!
//! The core only ever holds a [`SharedBackend`]. [`MemoryBackend`] is the
//! in-process emulator used for local development and tests. With the
//! `spanner` feature, `SpannerBackend` talks to Cloud Spanner or the
//! Spanner emulator.

pub mod clock;
pub mod ddl;
pub mod exec;
pub mod memory;
pub mod pattern;
pub mod persistence;
#[cfg(feature = "spanner")]
pub mod spanner;
pub mod statement;
pub mod table;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::{BackendResult, DatabasePath, Row, Value};

pub use memory::MemoryBackend;
#[cfg(feature = "spanner")]
pub use spanner::SpannerBackend;
pub use statement::{Column, Direction, Filter, OrderTerm, Projection, Statement, COUNT_COLUMN};

/// Handle shared by every component for the lifetime of the process.
pub type SharedBackend = Arc<dyn Backend>;

/// Placement and sizing requested when a container is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub id: String,
    pub placement: String,
    pub display_name: String,
    pub node_count: u32,
}

impl ContainerSpec {
    /// Smallest container the store accepts.
    pub fn minimal(id: impl Into<String>, placement: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: format!("{} instance", id),
            id,
            placement: placement.into(),
            node_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub placement: String,
    pub display_name: String,
    pub node_count: u32,
}

/// Query dialect a database is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Dialect {
    GoogleStandardSql,
    PostgreSql,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub path: DatabasePath,
    pub dialect: Dialect,
}

/// A row write. `columns` and `values` are positional; the primary key
/// column must be present.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Fails with `AlreadyExists` if the key is present.
    Insert {
        table: String,
        columns: Vec<Column>,
        values: Vec<Value>,
    },
    /// Fails with `NotFound` if the key is absent. Unlisted columns keep
    /// their stored values.
    Update {
        table: String,
        columns: Vec<Column>,
        values: Vec<Value>,
    },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } => table,
        }
    }

    pub fn columns(&self) -> &[Column] {
        match self {
            Self::Insert { columns, .. } | Self::Update { columns, .. } => columns,
        }
    }

    pub fn values(&self) -> &[Value] {
        match self {
            Self::Insert { values, .. } | Self::Update { values, .. } => values,
        }
    }

    /// Value written to the `id` column, if any.
    pub fn key(&self) -> Option<&str> {
        self.columns()
            .iter()
            .position(|c| *c == Column::Id)
            .and_then(|idx| self.values().get(idx))
            .and_then(Value::as_str)
    }
}

/// Strong reads at a single timestamp. Queries issued through the same
/// transaction observe the same snapshot.
#[async_trait]
pub trait ReadOnlyTransaction: Send + Sync {
    /// Timestamp the snapshot was taken at, when the store reports one.
    fn read_timestamp(&self) -> Option<DateTime<Utc>>;

    async fn query(&self, statement: &Statement) -> BackendResult<Vec<Row>>;
}

/// Locking read-write transaction. Rows read through it stay locked until
/// commit or drop.
#[async_trait]
pub trait ReadWriteTransaction: Send {
    async fn read_row(
        &mut self,
        table: &str,
        key: &str,
        columns: &[Column],
    ) -> BackendResult<Option<Row>>;

    /// Applies all mutations atomically and returns the commit timestamp.
    async fn commit(&mut self, mutations: Vec<Mutation>) -> BackendResult<DateTime<Utc>>;
}

/// Admin and data surface of the backing store.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_container(&self, container_id: &str) -> BackendResult<ContainerInfo>;

    async fn create_container(&self, spec: ContainerSpec) -> BackendResult<()>;

    async fn get_database(&self, path: &DatabasePath) -> BackendResult<DatabaseInfo>;

    async fn create_database(&self, path: &DatabasePath, dialect: Dialect) -> BackendResult<()>;

    /// DDL statements applied to the database so far, in order.
    async fn database_ddl(&self, path: &DatabasePath) -> BackendResult<Vec<String>>;

    async fn update_ddl(&self, path: &DatabasePath, statements: Vec<String>) -> BackendResult<()>;

    async fn single_use(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadOnlyTransaction>>;

    async fn begin(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadWriteTransaction>>;
}
