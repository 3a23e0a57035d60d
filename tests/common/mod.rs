#![allow(dead_code)]

//! Test support: a `Backend` decorator that counts calls and injects
//! failures, latency and lost-race answers in front of a `MemoryBackend`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kvstore::backend::{
    Backend, Column, ContainerInfo, ContainerSpec, DatabaseInfo, Dialect, MemoryBackend, Mutation,
    Projection, ReadOnlyTransaction, ReadWriteTransaction, SharedBackend, Statement,
};
use kvstore::core::{BackendError, BackendResult, DatabasePath, Row};
use kvstore::{KvService, ServiceConfig};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GET_CONTAINER: &str = "get_container";
pub const CREATE_CONTAINER: &str = "create_container";
pub const GET_DATABASE: &str = "get_database";
pub const CREATE_DATABASE: &str = "create_database";
pub const DATABASE_DDL: &str = "database_ddl";
pub const UPDATE_DDL: &str = "update_ddl";
pub const SINGLE_USE: &str = "single_use";
pub const BEGIN: &str = "begin";
pub const QUERY_FETCH: &str = "query_fetch";
pub const QUERY_COUNT: &str = "query_count";
pub const QUERY_PING: &str = "query_ping";
pub const COMMIT: &str = "commit";

#[derive(Default)]
struct FaultState {
    calls: Mutex<HashMap<String, usize>>,
    errors: Mutex<HashMap<String, BackendError>>,
    delays: Mutex<HashMap<String, Duration>>,
    missing: Mutex<HashSet<String>>,
}

impl FaultState {
    async fn enter(&self, op: &str) -> BackendResult<()> {
        *self.calls.lock().unwrap().entry(op.to_string()).or_default() += 1;

        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let error = self.errors.lock().unwrap().get(op).cloned();
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn pretends_missing(&self, op: &str) -> bool {
        self.missing.lock().unwrap().contains(op)
    }
}

pub struct FaultyBackend {
    inner: MemoryBackend,
    state: Arc<FaultState>,
}

impl FaultyBackend {
    pub fn new(inner: MemoryBackend) -> Arc<Self> {
        Arc::new(Self {
            inner,
            state: Arc::new(FaultState::default()),
        })
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Every call to `op` fails with `err` until cleared.
    pub fn fail(&self, op: &str, err: BackendError) {
        self.state.errors.lock().unwrap().insert(op.to_string(), err);
    }

    /// Every call to `op` sleeps for `delay` first.
    pub fn delay(&self, op: &str, delay: Duration) {
        self.state.delays.lock().unwrap().insert(op.to_string(), delay);
    }

    /// The existence check `op` answers `NotFound` even when the resource
    /// exists, as if a concurrent provisioner created it right after.
    pub fn pretend_missing(&self, op: &str) {
        self.state.missing.lock().unwrap().insert(op.to_string());
    }

    pub fn clear(&self) {
        self.state.errors.lock().unwrap().clear();
        self.state.delays.lock().unwrap().clear();
        self.state.missing.lock().unwrap().clear();
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn creation_calls(&self) -> usize {
        [CREATE_CONTAINER, CREATE_DATABASE, UPDATE_DDL]
            .iter()
            .map(|op| self.calls(op))
            .sum()
    }

    pub fn reset_calls(&self) {
        self.state.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Backend for FaultyBackend {
    async fn get_container(&self, container_id: &str) -> BackendResult<ContainerInfo> {
        self.state.enter(GET_CONTAINER).await?;
        if self.state.pretends_missing(GET_CONTAINER) {
            return Err(BackendError::NotFound(format!("container '{}'", container_id)));
        }
        self.inner.get_container(container_id).await
    }

    async fn create_container(&self, spec: ContainerSpec) -> BackendResult<()> {
        self.state.enter(CREATE_CONTAINER).await?;
        self.inner.create_container(spec).await
    }

    async fn get_database(&self, path: &DatabasePath) -> BackendResult<DatabaseInfo> {
        self.state.enter(GET_DATABASE).await?;
        if self.state.pretends_missing(GET_DATABASE) {
            return Err(BackendError::NotFound(format!("database '{}'", path)));
        }
        self.inner.get_database(path).await
    }

    async fn create_database(&self, path: &DatabasePath, dialect: Dialect) -> BackendResult<()> {
        self.state.enter(CREATE_DATABASE).await?;
        self.inner.create_database(path, dialect).await
    }

    async fn database_ddl(&self, path: &DatabasePath) -> BackendResult<Vec<String>> {
        self.state.enter(DATABASE_DDL).await?;
        if self.state.pretends_missing(DATABASE_DDL) {
            return Ok(Vec::new());
        }
        self.inner.database_ddl(path).await
    }

    async fn update_ddl(&self, path: &DatabasePath, statements: Vec<String>) -> BackendResult<()> {
        self.state.enter(UPDATE_DDL).await?;
        self.inner.update_ddl(path, statements).await
    }

    async fn single_use(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadOnlyTransaction>> {
        self.state.enter(SINGLE_USE).await?;
        let inner = self.inner.single_use(path).await?;
        Ok(Box::new(FaultyReadOnly {
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    async fn begin(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadWriteTransaction>> {
        self.state.enter(BEGIN).await?;
        let inner = self.inner.begin(path).await?;
        Ok(Box::new(FaultyReadWrite {
            inner,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FaultyReadOnly {
    inner: Box<dyn ReadOnlyTransaction>,
    state: Arc<FaultState>,
}

#[async_trait]
impl ReadOnlyTransaction for FaultyReadOnly {
    fn read_timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.read_timestamp()
    }

    async fn query(&self, statement: &Statement) -> BackendResult<Vec<Row>> {
        let op = match statement.projection() {
            Projection::CountStar => QUERY_COUNT,
            Projection::One => QUERY_PING,
            Projection::Columns(_) => QUERY_FETCH,
        };
        self.state.enter(op).await?;
        self.inner.query(statement).await
    }
}

struct FaultyReadWrite {
    inner: Box<dyn ReadWriteTransaction>,
    state: Arc<FaultState>,
}

#[async_trait]
impl ReadWriteTransaction for FaultyReadWrite {
    async fn read_row(
        &mut self,
        table: &str,
        key: &str,
        columns: &[Column],
    ) -> BackendResult<Option<Row>> {
        self.inner.read_row(table, key, columns).await
    }

    async fn commit(&mut self, mutations: Vec<Mutation>) -> BackendResult<DateTime<Utc>> {
        self.state.enter(COMMIT).await?;
        self.inner.commit(mutations).await
    }
}

pub fn config() -> ServiceConfig {
    ServiceConfig::new("kv-instance", "kvdb")
}

/// Provisioned service over a fresh fault-injecting backend.
pub async fn service() -> (KvService, Arc<FaultyBackend>) {
    let faulty = FaultyBackend::new(MemoryBackend::new());
    let backend: SharedBackend = faulty.clone();
    let service = KvService::from_backend(backend, config()).await.unwrap();
    faulty.reset_calls();
    (service, faulty)
}

/// Deterministic UUID-shaped key: `prefix` padded into the first group.
pub fn key(prefix: &str, n: u32) -> String {
    format!("{:0<8}-0000-4000-8000-{:012}", prefix, n)
}
