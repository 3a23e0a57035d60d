// ============================================================================
// kvstore Library
// ============================================================================

pub mod backend;
pub mod config;
pub mod core;
pub mod health;
pub mod provision;
pub mod query;
pub mod store;

use serde_json::Value as JsonValue;
use tracing::{event, Level};

pub use backend::{Backend, MemoryBackend, SharedBackend};
pub use config::{ConnectionTarget, ServiceConfig};
pub use crate::core::{
    BackendError, ErrorCategory, HealthStatus, InvalidInput, KvError, ProvisionError,
    ProvisionOutcome, ProvisionReport, ProvisionTarget, QueryError, Record, RecordKey,
    StoreError,
};
pub use health::HealthProbe;
pub use provision::{table_ddl, Provisioner};
pub use query::{KeyFilter, ListEngine, ListPage, ListParams, Page, RawListParams, SortKey};
pub use store::{RecordStore, WriteKind, WriteReceipt};

// ============================================================================
// Service facade
// ============================================================================

/// The provisioned key-value service
///
/// Construction provisions the backing store; a `KvService` only exists once
/// the container, database and table are known to be present. Cloning is
/// cheap and every clone shares the same backend handle.
///
/// # Examples
///
/// ```
/// use kvstore::{KvService, RawListParams, ServiceConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let service = KvService::start(ServiceConfig::new("kv-instance", "kvdb")).await?;
///
/// let key = "550e8400-e29b-41d4-a716-446655440000";
/// service.put(key, r#"{"name": "first"}"#).await?;
///
/// let record = service.get(key).await?.expect("just written");
/// assert_eq!(record.value["name"], "first");
///
/// let page = service.list(&RawListParams::default()).await?;
/// assert_eq!(page.total_count, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KvService {
    report: ProvisionReport,
    store: RecordStore,
    lists: ListEngine,
    probe: HealthProbe,
}

impl KvService {
    /// Validate the configuration, open the backend it names and provision.
    pub async fn start(config: ServiceConfig) -> Result<Self, ProvisionError> {
        config.validate().map_err(ProvisionError::InvalidTarget)?;
        let backend = config
            .connect_backend()
            .await
            .map_err(ProvisionError::Connect)?;
        Self::from_backend(backend, config).await
    }

    /// Provision over an already opened backend.
    pub async fn from_backend(
        backend: SharedBackend,
        config: ServiceConfig,
    ) -> Result<Self, ProvisionError> {
        config.validate().map_err(ProvisionError::InvalidTarget)?;

        let report = Provisioner::from_config(SharedBackend::clone(&backend), &config)
            .ensure_ready(&config.target())
            .await?;
        event!(
            Level::INFO,
            created = report.created_count(),
            target = %config.connection_target.to_url(),
            "service ready"
        );

        Ok(Self {
            report,
            store: RecordStore::from_config(SharedBackend::clone(&backend), &config),
            lists: ListEngine::from_config(SharedBackend::clone(&backend), &config),
            probe: HealthProbe::from_config(backend, &config),
        })
    }

    /// What provisioning found or created at startup.
    pub fn provision_report(&self) -> ProvisionReport {
        self.report
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn lists(&self) -> &ListEngine {
        &self.lists
    }

    /// Store a raw JSON body under `key`.
    pub async fn put(&self, key: &str, body: &str) -> Result<WriteReceipt, KvError> {
        let key = RecordKey::parse(key)?;
        let value: JsonValue = serde_json::from_str(body)
            .map_err(|e| InvalidInput::MalformedJson(e.to_string()))?;
        Ok(self.store.upsert(&key, value).await?)
    }

    pub async fn put_value(&self, key: &str, value: JsonValue) -> Result<WriteReceipt, KvError> {
        let key = RecordKey::parse(key)?;
        Ok(self.store.upsert(&key, value).await?)
    }

    /// `Ok(None)` when nothing was ever stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Record>, KvError> {
        let key = RecordKey::parse(key)?;
        Ok(self.store.read(&key).await?)
    }

    pub async fn list(&self, raw: &RawListParams) -> Result<ListPage, KvError> {
        Ok(self.lists.list_raw(raw).await?)
    }

    pub async fn health(&self) -> HealthStatus {
        self.probe.check().await
    }
}
