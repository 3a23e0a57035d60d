//! Cloud Spanner (or the Spanner emulator) behind the [`Backend`] trait.
//!
//! Admin calls go through one `AdminClient`. Data calls use one session
//! pool per database, opened on first use and kept for the life of the
//! backend. Statements are sent as their GoogleSQL rendering with the bound
//! parameters attached, and result rows are decoded back into [`Row`]s with
//! the same column names the emulator produces.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use gcloud_gax::conn::Environment;
use gcloud_gax::grpc::{Code, Status};
use gcloud_gax::retry::TryAs;
use gcloud_googleapis::spanner::admin::database::v1::{
    CreateDatabaseRequest, GetDatabaseDdlRequest, GetDatabaseRequest, UpdateDatabaseDdlRequest,
};
use gcloud_googleapis::spanner::admin::instance::v1::{
    CreateInstanceRequest, GetInstanceRequest, Instance,
};
use gcloud_spanner::admin::client::Client as AdminClient;
use gcloud_spanner::admin::AdminClientConfig;
use gcloud_spanner::client::{Client, ClientConfig, Error as ClientError};
use gcloud_spanner::key::Key;
use gcloud_spanner::mutation::{insert, update};
use gcloud_spanner::statement::{Statement as SpannerStatement, ToKind};
use gcloud_spanner::transaction_ro::ReadOnlyTransaction as SpannerReadOnly;
use gcloud_spanner::transaction_rw::ReadWriteTransaction as SpannerReadWrite;
use gcloud_spanner::value::CommitTimestamp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use super::statement::{Column, Projection, COUNT_COLUMN};
use super::{
    Backend, ContainerInfo, ContainerSpec, DatabaseInfo, Dialect, Mutation, ReadOnlyTransaction,
    ReadWriteTransaction, Statement,
};
use crate::core::{BackendError, BackendResult, DatabasePath, Row, Value};

const DIALECT_GOOGLE_STANDARD_SQL: i32 = 1;
const DIALECT_POSTGRESQL: i32 = 2;

// ----------------------------------------------------------------------------
// Status mapping
// ----------------------------------------------------------------------------

fn from_status(status: &Status) -> BackendError {
    let message = status.message().to_string();
    match status.code() {
        Code::NotFound => BackendError::NotFound(message),
        Code::AlreadyExists => BackendError::AlreadyExists(message),
        // Schema changes racing on the same name come back this way.
        Code::FailedPrecondition if message.contains("Duplicate name") => {
            BackendError::AlreadyExists(message)
        }
        Code::FailedPrecondition => BackendError::FailedPrecondition(message),
        Code::PermissionDenied | Code::Unauthenticated => BackendError::PermissionDenied(message),
        Code::InvalidArgument | Code::OutOfRange => BackendError::InvalidArgument(message),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted => {
            BackendError::Unavailable(message)
        }
        _ => BackendError::Internal(format!("{:?}: {}", status.code(), message)),
    }
}

fn status_error(status: Status) -> BackendError {
    from_status(&status)
}

fn client_error(err: ClientError) -> BackendError {
    match err.try_as() {
        Some(status) => from_status(status),
        None => BackendError::Unavailable(err.to_string()),
    }
}

fn connect_error(err: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable(format!("failed to connect to Spanner: {}", err))
}

// ----------------------------------------------------------------------------
// Resource names
// ----------------------------------------------------------------------------

fn project_path(project: &str) -> String {
    format!("projects/{}", project)
}

fn instance_path(project: &str, instance: &str) -> String {
    format!("{}/instances/{}", project_path(project), instance)
}

fn instance_config_path(project: &str, placement: &str) -> String {
    format!("{}/instanceConfigs/{}", project_path(project), placement)
}

fn database_path(project: &str, path: &DatabasePath) -> String {
    format!(
        "{}/databases/{}",
        instance_path(project, &path.container),
        path.database
    )
}

/// Last segment of a resource name.
fn short_name(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

fn create_database_statement(id: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::GoogleStandardSql => format!("CREATE DATABASE `{}`", id),
        Dialect::PostgreSql => format!("CREATE DATABASE \"{}\"", id),
    }
}

fn dialect_code(dialect: Dialect) -> i32 {
    match dialect {
        Dialect::GoogleStandardSql => DIALECT_GOOGLE_STANDARD_SQL,
        Dialect::PostgreSql => DIALECT_POSTGRESQL,
    }
}

fn dialect_from_code(code: i32) -> Dialect {
    match code {
        DIALECT_POSTGRESQL => Dialect::PostgreSql,
        _ => Dialect::GoogleStandardSql,
    }
}

// ----------------------------------------------------------------------------
// Value conversion
// ----------------------------------------------------------------------------

/// Wire form of a [`Value`]. JSON and timestamps travel as strings, which
/// Spanner coerces to the column type on write.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Bool(bool),
    Int64(i64),
    Text(String),
    CommitTimestamp,
}

impl Cell {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int64(i) => Self::Int64(*i),
            Value::String(s) => Self::Text(s.clone()),
            Value::Json(json) => Self::Text(json.to_string()),
            Value::Timestamp(ts) => Self::Text(format_timestamp(*ts)),
            Value::CommitTimestamp => Self::CommitTimestamp,
        }
    }

    fn to_kind(&self) -> Box<dyn ToKind> {
        match self {
            Self::Null => Box::new(Option::<String>::None),
            Self::Bool(b) => Box::new(*b),
            Self::Int64(i) => Box::new(*i),
            Self::Text(s) => Box::new(s.clone()),
            Self::CommitTimestamp => Box::new(CommitTimestamp::new()),
        }
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(column: &str, raw: &str) -> BackendResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            BackendError::Internal(format!("column '{}' holds a malformed timestamp: {}", column, e))
        })
}

fn parse_json(column: &str, raw: &str) -> BackendResult<Value> {
    serde_json::from_str(raw)
        .map(Value::Json)
        .map_err(|e| BackendError::Internal(format!("column '{}' holds malformed JSON: {}", column, e)))
}

fn to_spanner_statement(statement: &Statement) -> BackendResult<SpannerStatement> {
    let mut stmt = SpannerStatement::new(statement.to_string());
    for (name, value) in statement.params() {
        match Cell::from_value(value) {
            Cell::Null => stmt.add_param(name, &Option::<String>::None),
            Cell::Bool(b) => stmt.add_param(name, &b),
            Cell::Int64(i) => stmt.add_param(name, &i),
            Cell::Text(s) => stmt.add_param(name, &s),
            Cell::CommitTimestamp => {
                return Err(BackendError::InvalidArgument(format!(
                    "parameter '{}' cannot be a pending commit timestamp",
                    name
                )));
            }
        }
    }
    Ok(stmt)
}

fn to_spanner_mutation(mutation: &Mutation) -> gcloud_spanner::mutation::Mutation {
    let columns: Vec<&str> = mutation.columns().iter().map(Column::name).collect();
    let cells: Vec<Box<dyn ToKind>> = mutation
        .values()
        .iter()
        .map(|v| Cell::from_value(v).to_kind())
        .collect();
    let values: Vec<&dyn ToKind> = cells.iter().map(|c| c.as_ref()).collect();
    match mutation {
        Mutation::Insert { table, .. } => insert(table, &columns, &values),
        Mutation::Update { table, .. } => update(table, &columns, &values),
    }
}

fn decode_column(row: &gcloud_spanner::row::Row, column: Column) -> BackendResult<Value> {
    let raw: String = row.column_by_name(column.name()).map_err(|e| {
        BackendError::Internal(format!("failed to read column '{}': {}", column, e))
    })?;
    match column {
        Column::Id => Ok(Value::String(raw)),
        Column::Data => parse_json(column.name(), &raw),
        Column::CreatedAt | Column::UpdatedAt => {
            parse_timestamp(column.name(), &raw).map(Value::Timestamp)
        }
    }
}

fn decode_row(row: &gcloud_spanner::row::Row, projection: &Projection) -> BackendResult<Row> {
    match projection {
        Projection::Columns(columns) => {
            let names: Arc<[String]> = columns.iter().map(|c| c.name().to_string()).collect();
            let values = columns
                .iter()
                .map(|c| decode_column(row, *c))
                .collect::<BackendResult<Vec<_>>>()?;
            Ok(Row::new(names, values))
        }
        Projection::CountStar => {
            let count: i64 = row.column_by_name(COUNT_COLUMN).map_err(|e| {
                BackendError::Internal(format!("failed to read count: {}", e))
            })?;
            Ok(Row::new(
                Arc::from(vec![COUNT_COLUMN.to_string()]),
                vec![Value::Int64(count)],
            ))
        }
        Projection::One => {
            let one: i64 = row
                .column(0)
                .map_err(|e| BackendError::Internal(format!("failed to read ping result: {}", e)))?;
            Ok(Row::new(Arc::from(vec![String::new()]), vec![Value::Int64(one)]))
        }
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// Spanner-backed store scoped to one Google Cloud project.
pub struct SpannerBackend {
    project: String,
    emulator_host: Option<String>,
    admin: AdminClient,
    clients: AsyncMutex<HashMap<DatabasePath, Arc<Client>>>,
}

impl SpannerBackend {
    /// Connect the admin client. With `emulator_host` set every call goes to
    /// the emulator unauthenticated; otherwise application default
    /// credentials are used.
    pub async fn connect(project: &str, emulator_host: Option<&str>) -> BackendResult<Self> {
        let mut config = AdminClientConfig::default();
        match emulator_host {
            Some(host) => {
                info!(project, emulator = host, "connecting to Spanner emulator");
                config.environment = Environment::Emulator(host.to_string());
            }
            None => {
                info!(project, "connecting to production Spanner");
                config = config.with_auth().await.map_err(connect_error)?;
            }
        }
        let admin = AdminClient::new(config).await.map_err(connect_error)?;

        Ok(Self {
            project: project.to_string(),
            emulator_host: emulator_host.map(str::to_string),
            admin,
            clients: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    async fn client(&self, path: &DatabasePath) -> BackendResult<Arc<Client>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(path) {
            return Ok(Arc::clone(client));
        }

        let mut config = ClientConfig::default();
        match &self.emulator_host {
            Some(host) => config.environment = Environment::Emulator(host.clone()),
            None => config = config.with_auth().await.map_err(connect_error)?,
        }
        let name = database_path(&self.project, path);
        let client = Arc::new(Client::new(&name, config).await.map_err(client_error)?);
        debug!(database = %name, "opened session pool");

        clients.insert(path.clone(), Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl Backend for SpannerBackend {
    async fn get_container(&self, container_id: &str) -> BackendResult<ContainerInfo> {
        let request = GetInstanceRequest {
            name: instance_path(&self.project, container_id),
            field_mask: None,
        };
        let instance = self
            .admin
            .instance()
            .get_instance(request, None)
            .await
            .map_err(status_error)?
            .into_inner();

        Ok(ContainerInfo {
            id: short_name(&instance.name).to_string(),
            placement: short_name(&instance.config).to_string(),
            display_name: instance.display_name,
            node_count: u32::try_from(instance.node_count).unwrap_or(0),
        })
    }

    async fn create_container(&self, spec: ContainerSpec) -> BackendResult<()> {
        let node_count = i32::try_from(spec.node_count).map_err(|_| {
            BackendError::InvalidArgument(format!("node count {} is too large", spec.node_count))
        })?;
        let request = CreateInstanceRequest {
            parent: project_path(&self.project),
            instance_id: spec.id.clone(),
            instance: Some(Instance {
                name: instance_path(&self.project, &spec.id),
                config: instance_config_path(&self.project, &spec.placement),
                display_name: spec.display_name.clone(),
                node_count,
                ..Default::default()
            }),
        };
        let mut operation = self
            .admin
            .instance()
            .create_instance(request, None)
            .await
            .map_err(status_error)?;
        operation.wait(None).await.map_err(status_error)?;

        debug!(container = %spec.id, placement = %spec.placement, "container created");
        Ok(())
    }

    async fn get_database(&self, path: &DatabasePath) -> BackendResult<DatabaseInfo> {
        let request = GetDatabaseRequest {
            name: database_path(&self.project, path),
        };
        let database = self
            .admin
            .database()
            .get_database(request, None)
            .await
            .map_err(status_error)?
            .into_inner();

        Ok(DatabaseInfo {
            path: path.clone(),
            dialect: dialect_from_code(database.database_dialect),
        })
    }

    async fn create_database(&self, path: &DatabasePath, dialect: Dialect) -> BackendResult<()> {
        let request = CreateDatabaseRequest {
            parent: instance_path(&self.project, &path.container),
            create_statement: create_database_statement(&path.database, dialect),
            database_dialect: dialect_code(dialect),
            ..Default::default()
        };
        let mut operation = self
            .admin
            .database()
            .create_database(request, None)
            .await
            .map_err(status_error)?;
        operation.wait(None).await.map_err(status_error)?;

        debug!(database = %path, ?dialect, "database created");
        Ok(())
    }

    async fn database_ddl(&self, path: &DatabasePath) -> BackendResult<Vec<String>> {
        let request = GetDatabaseDdlRequest {
            database: database_path(&self.project, path),
        };
        let response = self
            .admin
            .database()
            .get_database_ddl(request, None)
            .await
            .map_err(status_error)?;
        Ok(response.into_inner().statements)
    }

    async fn update_ddl(&self, path: &DatabasePath, statements: Vec<String>) -> BackendResult<()> {
        let count = statements.len();
        let request = UpdateDatabaseDdlRequest {
            database: database_path(&self.project, path),
            statements,
            ..Default::default()
        };
        let mut operation = self
            .admin
            .database()
            .update_database_ddl(request, None)
            .await
            .map_err(status_error)?;
        operation.wait(None).await.map_err(status_error)?;

        debug!(database = %path, statements = count, "schema updated");
        Ok(())
    }

    async fn single_use(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadOnlyTransaction>> {
        let client = self.client(path).await?;
        let tx = client.read_only_transaction().await.map_err(client_error)?;
        let read_timestamp = tx
            .rts
            .and_then(|ts| i64::try_from(ts.unix_timestamp_nanos()).ok())
            .map(DateTime::from_timestamp_nanos);

        Ok(Box::new(SpannerSnapshot {
            read_timestamp,
            tx: AsyncMutex::new(tx),
        }))
    }

    async fn begin(&self, path: &DatabasePath) -> BackendResult<Box<dyn ReadWriteTransaction>> {
        let client = self.client(path).await?;
        let tx = client
            .begin_read_write_transaction()
            .await
            .map_err(client_error)?;
        Ok(Box::new(SpannerTransaction { tx: Some(tx) }))
    }
}

/// Multi-use read-only transaction. Queries run one at a time because the
/// client needs exclusive access to stream a result set.
struct SpannerSnapshot {
    read_timestamp: Option<DateTime<Utc>>,
    tx: AsyncMutex<SpannerReadOnly>,
}

#[async_trait]
impl ReadOnlyTransaction for SpannerSnapshot {
    fn read_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read_timestamp
    }

    async fn query(&self, statement: &Statement) -> BackendResult<Vec<Row>> {
        let stmt = to_spanner_statement(statement)?;
        let mut tx = self.tx.lock().await;
        let mut rows = tx.query(stmt).await.map_err(status_error)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(status_error)? {
            out.push(decode_row(&row, statement.projection())?);
        }
        Ok(out)
    }
}

struct SpannerTransaction {
    tx: Option<SpannerReadWrite>,
}

impl SpannerTransaction {
    fn open(&mut self) -> BackendResult<&mut SpannerReadWrite> {
        self.tx.as_mut().ok_or_else(|| {
            BackendError::FailedPrecondition("transaction already committed".into())
        })
    }
}

#[async_trait]
impl ReadWriteTransaction for SpannerTransaction {
    async fn read_row(
        &mut self,
        table: &str,
        key: &str,
        columns: &[Column],
    ) -> BackendResult<Option<Row>> {
        let names: Vec<&str> = columns.iter().map(Column::name).collect();
        let tx = self.open()?;
        let row = tx
            .read_row(table, &names, Key::new(&key.to_string()))
            .await
            .map_err(status_error)?;
        row.map(|row| decode_row(&row, &Projection::Columns(columns.to_vec())))
            .transpose()
    }

    async fn commit(&mut self, mutations: Vec<Mutation>) -> BackendResult<DateTime<Utc>> {
        let mut tx = self.tx.take().ok_or_else(|| {
            BackendError::FailedPrecondition("transaction already committed".into())
        })?;
        let count = mutations.len();
        tx.buffer_write(mutations.iter().map(to_spanner_mutation).collect());

        let (result, ()) = tx
            .end(Ok::<(), ClientError>(()), None)
            .await
            .map_err(client_error)?;
        let commit_ts = result
            .timestamp
            .and_then(|ts| DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?))
            .ok_or_else(|| BackendError::Internal("commit returned no timestamp".into()))?;

        debug!(mutations = count, %commit_ts, "transaction committed");
        Ok(commit_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Filter;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_status_codes_map_to_backend_errors() {
        let cases = [
            (Code::NotFound, "missing", BackendError::NotFound("missing".into())),
            (Code::AlreadyExists, "dup", BackendError::AlreadyExists("dup".into())),
            (Code::Unauthenticated, "who", BackendError::PermissionDenied("who".into())),
            (Code::OutOfRange, "big", BackendError::InvalidArgument("big".into())),
            (Code::Aborted, "retry", BackendError::Unavailable("retry".into())),
            (Code::DeadlineExceeded, "slow", BackendError::Unavailable("slow".into())),
            (Code::FailedPrecondition, "busy", BackendError::FailedPrecondition("busy".into())),
        ];
        for (code, message, expected) in cases {
            assert_eq!(from_status(&Status::new(code, message)), expected);
        }
        assert!(matches!(
            from_status(&Status::new(Code::DataLoss, "gone")),
            BackendError::Internal(_)
        ));
    }

    #[test]
    fn test_duplicate_schema_name_counts_as_existing() {
        let status = Status::new(
            Code::FailedPrecondition,
            "Duplicate name in schema: kv_store.",
        );
        assert!(from_status(&status).is_already_exists());
    }

    #[test]
    fn test_resource_paths() {
        let path = DatabasePath::new("kv-instance", "kvdb");
        assert_eq!(project_path("p"), "projects/p");
        assert_eq!(instance_path("p", "kv-instance"), "projects/p/instances/kv-instance");
        assert_eq!(
            instance_config_path("p", "emulator-config"),
            "projects/p/instanceConfigs/emulator-config"
        );
        assert_eq!(
            database_path("p", &path),
            "projects/p/instances/kv-instance/databases/kvdb"
        );
        assert_eq!(short_name("projects/p/instanceConfigs/nam3"), "nam3");
        assert_eq!(short_name("bare"), "bare");
    }

    #[test]
    fn test_dialects() {
        assert_eq!(
            create_database_statement("kvdb", Dialect::GoogleStandardSql),
            "CREATE DATABASE `kvdb`"
        );
        assert_eq!(
            create_database_statement("kvdb", Dialect::PostgreSql),
            "CREATE DATABASE \"kvdb\""
        );
        for dialect in [Dialect::GoogleStandardSql, Dialect::PostgreSql] {
            assert_eq!(dialect_from_code(dialect_code(dialect)), dialect);
        }
        assert_eq!(dialect_from_code(0), Dialect::GoogleStandardSql);
    }

    #[test]
    fn test_values_become_wire_cells() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(Cell::from_value(&Value::Null), Cell::Null);
        assert_eq!(Cell::from_value(&Value::Int64(7)), Cell::Int64(7));
        assert_eq!(
            Cell::from_value(&Value::Json(json!({"a": [1, 2]}))),
            Cell::Text(r#"{"a":[1,2]}"#.to_string())
        );
        assert_eq!(
            Cell::from_value(&Value::Timestamp(ts)),
            Cell::Text("2024-05-01T12:00:00.000000000Z".to_string())
        );
        assert_eq!(Cell::from_value(&Value::CommitTimestamp), Cell::CommitTimestamp);
    }

    #[test]
    fn test_commit_timestamp_cannot_be_a_parameter() {
        let stmt = Statement::select("kv_store", &[Column::Id])
            .filter(Filter::equals(Column::CreatedAt, "ts"))
            .bind("ts", Value::CommitTimestamp);

        let err = to_spanner_statement(&stmt).err().unwrap();
        assert!(matches!(err, BackendError::InvalidArgument(_)));
    }

    #[test]
    fn test_stored_strings_decode() {
        let ts = parse_timestamp("created_at", "2024-05-01T12:00:00.123456789Z").unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_789);
        assert!(parse_timestamp("created_at", "yesterday").is_err());

        assert_eq!(parse_json("data", r#"{"n": 1}"#).unwrap(), Value::Json(json!({"n": 1})));
        assert!(matches!(
            parse_json("data", "{oops").unwrap_err(),
            BackendError::Internal(_)
        ));
    }
}
