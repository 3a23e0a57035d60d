//! In-process emulator of the backing store.
//!
//! Data lives in [`Table`]s whose rows are persistent ordered maps, so a
//! read-only transaction is a cheap clone of the table set. Read-write
//! transactions lock rows as they read them. Every change, admin or data,
//! is staged under the commit gate, written to the snapshot file when the
//! instance is file-backed, and only then installed. A change whose
//! snapshot write fails is never visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};
use tracing::{debug, info};

use super::clock::CommitClock;
use super::ddl::parse_create_table;
use super::exec::execute;
use super::persistence::{
    CatalogImage, ContainerImage, DatabaseImage, SnapshotFile, SNAPSHOT_VERSION,
};
use super::statement::Column;
use super::table::{table_key, Table};
use super::{
    Backend, ContainerInfo, ContainerSpec, DatabaseInfo, Dialect, Mutation, ReadOnlyTransaction,
    ReadWriteTransaction, Statement,
};
use crate::core::{BackendError, BackendResult, DatabasePath, Row};

#[derive(Debug)]
struct DatabaseState {
    dialect: Dialect,
    ddl: Vec<String>,
    /// Keyed by [`table_key`].
    tables: BTreeMap<String, Table>,
}

impl DatabaseState {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            ddl: Vec::new(),
            tables: BTreeMap::new(),
        }
    }
}

type SharedDatabase = Arc<RwLock<DatabaseState>>;

#[derive(Debug, Default)]
struct Catalog {
    containers: BTreeMap<String, ContainerInfo>,
    databases: HashMap<DatabasePath, SharedDatabase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowLockKey {
    path: DatabasePath,
    table: String,
    key: String,
}

/// Exclusive per-row locks held by read-write transactions.
#[derive(Debug, Default)]
struct RowLocks {
    locks: Mutex<HashMap<RowLockKey, Arc<AsyncMutex<()>>>>,
}

impl RowLocks {
    async fn acquire(&self, key: RowLockKey) -> BackendResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock()?;
            Arc::clone(locks.entry(key).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Drop entries nobody holds or waits on.
    fn prune<'a>(&self, keys: impl Iterator<Item = &'a RowLockKey>) {
        if let Ok(mut locks) = self.locks.lock() {
            for key in keys {
                if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                    locks.remove(key);
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// A validated change that is not installed yet.
enum Staged<'a> {
    Container(&'a ContainerInfo),
    Database(&'a DatabasePath, Dialect),
    Tables {
        path: &'a DatabasePath,
        tables: &'a BTreeMap<String, Table>,
        ddl: Option<&'a [String]>,
    },
}

impl Staged<'_> {
    fn overlay(self, image: &mut CatalogImage) {
        match self {
            Staged::Container(c) => image.containers.push(ContainerImage {
                id: c.id.clone(),
                placement: c.placement.clone(),
                display_name: c.display_name.clone(),
                node_count: c.node_count,
            }),
            Staged::Database(path, dialect) => image.databases.push(DatabaseImage {
                container: path.container.clone(),
                database: path.database.clone(),
                dialect,
                ddl: Vec::new(),
                tables: BTreeMap::new(),
            }),
            Staged::Tables { path, tables, ddl } => {
                if let Some(db) = image
                    .databases
                    .iter_mut()
                    .find(|db| db.container == path.container && db.database == path.database)
                {
                    db.tables = tables.clone();
                    if let Some(ddl) = ddl {
                        db.ddl = ddl.to_vec();
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    catalog: RwLock<Catalog>,
    clock: CommitClock,
    row_locks: RowLocks,
    snapshot: Option<SnapshotFile>,
    /// Exclusive while a change is staged, saved and installed. Shared while
    /// a read snapshot is cloned, so no snapshot sees a half-installed change.
    commit_gate: AsyncRwLock<()>,
}

impl Inner {
    fn empty(snapshot: Option<SnapshotFile>) -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            clock: CommitClock::new(),
            row_locks: RowLocks::default(),
            snapshot,
            commit_gate: AsyncRwLock::new(()),
        }
    }

    fn database(&self, path: &DatabasePath) -> BackendResult<SharedDatabase> {
        let catalog = self.catalog.read()?;
        if !catalog.containers.contains_key(&path.container) {
            return Err(BackendError::NotFound(format!(
                "container '{}'",
                path.container
            )));
        }
        catalog
            .databases
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("database '{}'", path)))
    }

    fn image(&self) -> BackendResult<CatalogImage> {
        let catalog = self.catalog.read()?;
        let containers = catalog
            .containers
            .values()
            .map(|c| ContainerImage {
                id: c.id.clone(),
                placement: c.placement.clone(),
                display_name: c.display_name.clone(),
                node_count: c.node_count,
            })
            .collect();

        let mut databases = Vec::with_capacity(catalog.databases.len());
        for (path, db) in &catalog.databases {
            let state = db.read()?;
            databases.push(DatabaseImage {
                container: path.container.clone(),
                database: path.database.clone(),
                dialect: state.dialect,
                ddl: state.ddl.clone(),
                tables: state.tables.clone(),
            });
        }

        Ok(CatalogImage {
            version: SNAPSHOT_VERSION,
            last_commit_micros: self.clock.last_micros(),
            containers,
            databases,
        })
    }

    /// Write the catalog with `staged` applied if this instance is
    /// file-backed. Callers hold the commit gate exclusively and install
    /// `staged` only once this returns `Ok`.
    async fn persist(&self, staged: Staged<'_>) -> BackendResult<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let mut image = self.image()?;
        staged.overlay(&mut image);
        let rows = image.row_count();

        let file = snapshot.clone();
        tokio::task::spawn_blocking(move || file.save(&image))
            .await
            .map_err(|e| BackendError::Internal(format!("snapshot writer failed: {}", e)))??;

        debug!(
            path = %snapshot.path().display(),
            rows,
            "catalog snapshot written"
        );
        Ok(())
    }

    fn restore(image: CatalogImage, snapshot: SnapshotFile) -> Self {
        let mut catalog = Catalog::default();
        for c in image.containers {
            catalog.containers.insert(
                c.id.clone(),
                ContainerInfo {
                    id: c.id,
                    placement: c.placement,
                    display_name: c.display_name,
                    node_count: c.node_count,
                },
            );
        }
        for db in image.databases {
            let tables = db
                .tables
                .into_iter()
                .map(|(name, table)| (table_key(&name), table))
                .collect();
            catalog.databases.insert(
                DatabasePath::new(db.container, db.database),
                Arc::new(RwLock::new(DatabaseState {
                    dialect: db.dialect,
                    ddl: db.ddl,
                    tables,
                })),
            );
        }

        Self {
            catalog: RwLock::new(catalog),
            clock: CommitClock::starting_after(image.last_commit_micros),
            row_locks: RowLocks::default(),
            snapshot: Some(snapshot),
            commit_gate: AsyncRwLock::new(()),
        }
    }
}

/// Emulator backend. Cloning shares the same underlying store.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Purely in-memory instance; everything is lost when it is dropped.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::empty(None)),
        }
    }

    /// File-backed instance. Restores the snapshot at `path` if one exists.
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let snapshot = SnapshotFile::new(path);
        let inner = match snapshot.load()? {
            Some(image) => {
                info!(
                    path = %snapshot.path().display(),
                    containers = image.containers.len(),
                    databases = image.databases.len(),
                    rows = image.row_count(),
                    "restored emulator catalog"
                );
                Inner::restore(image, snapshot)
            }
            None => {
                info!(path = %snapshot.path().display(), "starting empty file-backed emulator");
                Inner::empty(Some(snapshot))
            }
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.snapshot.is_some()
    }

    fn stage_container(&self, spec: ContainerSpec) -> BackendResult<ContainerInfo> {
        if spec.node_count == 0 {
            return Err(BackendError::InvalidArgument(
                "node_count must be at least 1".into(),
            ));
        }
        if spec.placement.is_empty() {
            return Err(BackendError::InvalidArgument(
                "placement cannot be empty".into(),
            ));
        }

        let catalog = self.inner.catalog.read()?;
        if catalog.containers.contains_key(&spec.id) {
            return Err(BackendError::AlreadyExists(format!("container '{}'", spec.id)));
        }
        Ok(ContainerInfo {
            id: spec.id,
            placement: spec.placement,
            display_name: spec.display_name,
            node_count: spec.node_count,
        })
    }

    fn stage_database(&self, path: &DatabasePath) -> BackendResult<()> {
        let catalog = self.inner.catalog.read()?;
        if !catalog.containers.contains_key(&path.container) {
            return Err(BackendError::NotFound(format!(
                "container '{}'",
                path.container
            )));
        }
        if catalog.databases.contains_key(path) {
            return Err(BackendError::AlreadyExists(format!("database '{}'", path)));
        }
        Ok(())
    }

    /// New table set and DDL history with `statements` applied, all or none.
    fn stage_ddl(
        &self,
        path: &DatabasePath,
        statements: &[String],
    ) -> BackendResult<(BTreeMap<String, Table>, Vec<String>)> {
        let db = self.inner.database(path)?;
        let state = db.read()?;

        let mut tables = state.tables.clone();
        for ddl in statements {
            let schema = parse_create_table(ddl)?;
            let key = table_key(schema.name());
            if tables.contains_key(&key) {
                return Err(BackendError::AlreadyExists(format!(
                    "table '{}' in '{}'",
                    schema.name(),
                    path
                )));
            }
            tables.insert(key, Table::new(schema));
        }

        let mut history = state.ddl.clone();
        history.extend_from_slice(statements);
        Ok((tables, history))
    }

    fn snapshot_of(&self, path: &DatabasePath) -> BackendResult<MemorySnapshot> {
        let db = self.inner.database(path)?;
        let state = db.read()?;
        Ok(MemorySnapshot {
            read_timestamp: self.inner.clock.read_timestamp()?,
            tables: state.tables.clone(),
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_container(&self, container_id: &str) -> BackendResult<ContainerInfo> {
        let catalog = self.inner.catalog.read()?;
        catalog
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("container '{}'", container_id)))
    }

    async fn create_container(&self, spec: ContainerSpec) -> BackendResult<()> {
        let _gate = self.inner.commit_gate.write().await;
        let container = self.stage_container(spec)?;
        self.inner.persist(Staged::Container(&container)).await?;

        debug!(container = %container.id, "container created");
        self.inner
            .catalog
            .write()?
            .containers
            .insert(container.id.clone(), container);
        Ok(())
    }

    async fn get_database(&self, path: &DatabasePath) -> BackendResult<DatabaseInfo> {
        let db = self.inner.database(path)?;
        let dialect = db.read()?.dialect;
        Ok(DatabaseInfo {
            path: path.clone(),
            dialect,
        })
    }

    async fn create_database(&self, path: &DatabasePath, dialect: Dialect) -> BackendResult<()> {
        let _gate = self.inner.commit_gate.write().await;
        self.stage_database(path)?;
        self.inner.persist(Staged::Database(path, dialect)).await?;

        self.inner.catalog.write()?.databases.insert(
            path.clone(),
            Arc::new(RwLock::new(DatabaseState::new(dialect))),
        );
        debug!(database = %path, ?dialect, "database created");
        Ok(())
    }

    async fn database_ddl(&self, path: &DatabasePath) -> BackendResult<Vec<String>> {
        let db = self.inner.database(path)?;
        let ddl = db.read()?.ddl.clone();
        Ok(ddl)
    }

    async fn update_ddl(&self, path: &DatabasePath, statements: Vec<String>) -> BackendResult<()> {
        let _gate = self.inner.commit_gate.write().await;
        let (tables, ddl) = self.stage_ddl(path, &statements)?;
        self.inner
            .persist(Staged::Tables {
                path,
                tables: &tables,
                ddl: Some(&ddl),
            })
            .await?;

        let db = self.inner.database(path)?;
        {
            let mut state = db.write()?;
            state.tables = tables;
            state.ddl = ddl;
        }
        debug!(database = %path, statements = statements.len(), "schema updated");
        Ok(())
    }

    async fn single_use(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadOnlyTransaction>> {
        let _gate = self.inner.commit_gate.read().await;
        Ok(Box::new(self.snapshot_of(path)?))
    }

    async fn begin(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadWriteTransaction>> {
        let db = self.inner.database(path)?;
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            db,
            path: path.clone(),
            held: HashMap::new(),
            committed: false,
        }))
    }
}

/// Strong read frozen at the moment the transaction was opened.
struct MemorySnapshot {
    read_timestamp: DateTime<Utc>,
    tables: BTreeMap<String, Table>,
}

#[async_trait]
impl ReadOnlyTransaction for MemorySnapshot {
    fn read_timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.read_timestamp)
    }

    async fn query(&self, statement: &Statement) -> BackendResult<Vec<Row>> {
        execute(&self.tables, statement)
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    db: SharedDatabase,
    path: DatabasePath,
    held: HashMap<RowLockKey, OwnedMutexGuard<()>>,
    committed: bool,
}

impl MemoryTransaction {
    fn lock_key(&self, table: &str, key: &str) -> RowLockKey {
        RowLockKey {
            path: self.path.clone(),
            table: table_key(table),
            key: key.to_string(),
        }
    }

    async fn lock_row(&mut self, table: &str, key: &str) -> BackendResult<()> {
        let lock_key = self.lock_key(table, key);
        if !self.held.contains_key(&lock_key) {
            let guard = self.inner.row_locks.acquire(lock_key.clone()).await?;
            self.held.insert(lock_key, guard);
        }
        Ok(())
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.committed {
            return Err(BackendError::FailedPrecondition(
                "transaction already committed".into(),
            ));
        }
        Ok(())
    }

    fn read_locked(&self, table: &str, key: &str, columns: &[Column]) -> BackendResult<Option<Row>> {
        let state = self.db.read()?;
        let table = state
            .tables
            .get(&table_key(table))
            .ok_or_else(|| BackendError::NotFound(format!("table '{}'", table)))?;
        let positions = columns
            .iter()
            .map(|c| table.schema().require_column(c.name()))
            .collect::<BackendResult<Vec<_>>>()?;

        Ok(table.get(key).map(|values| {
            let names: Arc<[String]> = columns.iter().map(|c| c.name().to_string()).collect();
            Row::new(names, positions.iter().map(|p| values[*p].clone()).collect())
        }))
    }

    /// Apply `mutations` to a copy of the tables under a fresh commit timestamp.
    fn stage(&self, mutations: &[Mutation]) -> BackendResult<(BTreeMap<String, Table>, DateTime<Utc>)> {
        let mut tables = self.db.read()?.tables.clone();
        let commit_ts = self.inner.clock.next_commit()?;

        for mutation in mutations {
            let table = tables.get_mut(&table_key(mutation.table())).ok_or_else(|| {
                BackendError::NotFound(format!("table '{}'", mutation.table()))
            })?;
            match mutation {
                Mutation::Insert {
                    columns, values, ..
                } => table.insert(columns, values, commit_ts)?,
                Mutation::Update {
                    columns, values, ..
                } => table.update(columns, values, commit_ts)?,
            }
        }
        Ok((tables, commit_ts))
    }

    async fn write_through(&self, mutations: &[Mutation]) -> BackendResult<DateTime<Utc>> {
        let _gate = self.inner.commit_gate.write().await;
        let (tables, commit_ts) = self.stage(mutations)?;
        self.inner
            .persist(Staged::Tables {
                path: &self.path,
                tables: &tables,
                ddl: None,
            })
            .await?;

        self.db.write()?.tables = tables;
        Ok(commit_ts)
    }

    fn release(&mut self) {
        let keys: Vec<RowLockKey> = self.held.drain().map(|(key, _guard)| key).collect();
        self.inner.row_locks.prune(keys.iter());
    }
}

#[async_trait]
impl ReadWriteTransaction for MemoryTransaction {
    async fn read_row(
        &mut self,
        table: &str,
        key: &str,
        columns: &[Column],
    ) -> BackendResult<Option<Row>> {
        self.ensure_open()?;
        self.lock_row(table, key).await?;
        self.read_locked(table, key, columns)
    }

    async fn commit(&mut self, mutations: Vec<Mutation>) -> BackendResult<DateTime<Utc>> {
        self.ensure_open()?;

        for mutation in &mutations {
            let key = mutation.key().ok_or_else(|| {
                BackendError::InvalidArgument(format!(
                    "mutation on '{}' does not set the primary key",
                    mutation.table()
                ))
            })?;
            self.lock_row(mutation.table(), key).await?;
        }

        let result = self.write_through(&mutations).await;
        self.committed = true;
        self.release();
        let commit_ts = result?;

        debug!(
            database = %self.path,
            mutations = mutations.len(),
            commit_ts = %commit_ts.to_rfc3339(),
            "transaction committed"
        );
        Ok(commit_ts)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}
