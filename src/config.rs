use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{MemoryBackend, SharedBackend};
use crate::core::{BackendError, ProvisionTarget};

pub const DEFAULT_TABLE: &str = "kv_store";
pub const EMULATOR_PLACEMENT: &str = "emulator-config";
/// Placement for containers created on production Spanner.
pub const SPANNER_PLACEMENT: &str = "regional-us-central1";

/// Where the backing store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// Process-local emulator, lost on exit. `memory://`
    Memory,
    /// Emulator snapshotted to a file after every change. `file://<path>`
    File(PathBuf),
    /// Cloud Spanner in `project`, or the Spanner emulator when
    /// `emulator_host` is set. `spanner://<project>[?emulator=<host:port>]`
    Spanner {
        project: String,
        emulator_host: Option<String>,
    },
}

impl ConnectionTarget {
    /// Parse from connection string
    ///
    /// # Examples
    ///
    /// ```
    /// use kvstore::ConnectionTarget;
    ///
    /// assert_eq!(ConnectionTarget::from_url("memory://").unwrap(), ConnectionTarget::Memory);
    /// assert!(matches!(
    ///     ConnectionTarget::from_url("file:///var/lib/kv.snapshot").unwrap(),
    ///     ConnectionTarget::File(_)
    /// ));
    /// assert_eq!(
    ///     ConnectionTarget::from_url("spanner://local-project?emulator=localhost:9010").unwrap(),
    ///     ConnectionTarget::Spanner {
    ///         project: "local-project".to_string(),
    ///         emulator_host: Some("localhost:9010".to_string()),
    ///     }
    /// );
    /// ```
    pub fn from_url(url: &str) -> Result<Self, String> {
        if url == "memory://" || url == "memory" {
            return Ok(Self::Memory);
        }
        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                return Err("file:// target needs a path".to_string());
            }
            return Ok(Self::File(PathBuf::from(path)));
        }
        if let Some(rest) = url.strip_prefix("spanner://") {
            return Self::parse_spanner(rest);
        }
        Err(format!(
            "connection target must be 'memory://', 'file://<path>' or 'spanner://<project>', got '{}'",
            url
        ))
    }

    fn parse_spanner(rest: &str) -> Result<Self, String> {
        let (project, query) = match rest.split_once('?') {
            Some((project, query)) => (project, Some(query)),
            None => (rest, None),
        };
        if project.is_empty() || project.contains('/') {
            return Err(format!(
                "spanner:// target needs a project id, got '{}'",
                project
            ));
        }

        let mut emulator_host = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("emulator", host)) if !host.is_empty() => {
                    emulator_host = Some(host.to_string());
                }
                _ => {
                    return Err(format!(
                        "unsupported spanner:// option '{}', expected 'emulator=<host:port>'",
                        pair
                    ));
                }
            }
        }

        Ok(Self::Spanner {
            project: project.to_string(),
            emulator_host,
        })
    }

    pub fn to_url(&self) -> String {
        match self {
            Self::Memory => "memory://".to_string(),
            Self::File(path) => format!("file://{}", path.display()),
            Self::Spanner {
                project,
                emulator_host: Some(host),
            } => format!("spanner://{}?emulator={}", project, host),
            Self::Spanner {
                project,
                emulator_host: None,
            } => format!("spanner://{}", project),
        }
    }

    /// Placement new containers get unless one is configured: the emulator
    /// config everywhere except production Spanner.
    pub fn default_placement(&self) -> &'static str {
        match self {
            Self::Spanner {
                emulator_host: None,
                ..
            } => SPANNER_PLACEMENT,
            _ => EMULATOR_PLACEMENT,
        }
    }
}

/// Service configuration
///
/// Built with [`ServiceConfig::new`] plus the chained setters, or read from
/// the process environment with [`ServiceConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub container_id: String,
    pub database_id: String,
    pub table_name: String,
    pub connection_target: ConnectionTarget,

    /// Placement the container is created with when absent
    pub placement: String,

    /// Upper bound for each provisioning step
    pub provision_timeout: Duration,

    /// Upper bound for every upsert, read and list call
    pub operation_timeout: Duration,

    /// Upper bound for the health round trip
    pub health_timeout: Duration,
}

impl ServiceConfig {
    pub fn new(container_id: &str, database_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            database_id: database_id.to_string(),
            table_name: DEFAULT_TABLE.to_string(),
            connection_target: ConnectionTarget::Memory,
            placement: EMULATOR_PLACEMENT.to_string(),
            provision_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(2),
        }
    }

    pub fn table_name(mut self, table_name: &str) -> Self {
        self.table_name = table_name.to_string();
        self
    }

    /// Also moves the placement to the new target's default, unless a
    /// placement other than the old target's default was set.
    pub fn connection_target(mut self, target: ConnectionTarget) -> Self {
        if self.placement == self.connection_target.default_placement() {
            self.placement = target.default_placement().to_string();
        }
        self.connection_target = target;
        self
    }

    pub fn placement(mut self, placement: &str) -> Self {
        self.placement = placement.to_string();
        self
    }

    pub fn provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Read `KV_CONTAINER`, `KV_DATABASE` (required), `KV_TABLE`,
    /// `KV_CONNECTION`, `KV_PLACEMENT` and `KV_OPERATION_TIMEOUT_MS`.
    ///
    /// The Spanner variables are honoured as well: `SPANNER_INSTANCE` and
    /// `SPANNER_DATABASE` stand in for the first two, and without
    /// `KV_CONNECTION` a `SPANNER_PROJECT` (plus optional
    /// `SPANNER_EMULATOR_HOST`) selects a Spanner target.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let present = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let required = |name: &str, fallback: &str| {
            present(name)
                .or_else(|| present(fallback))
                .ok_or_else(|| format!("{} environment variable is required", name))
        };

        let mut config = Self::new(
            &required("KV_CONTAINER", "SPANNER_INSTANCE")?,
            &required("KV_DATABASE", "SPANNER_DATABASE")?,
        );

        if let Some(table) = lookup("KV_TABLE") {
            config = config.table_name(&table);
        }
        if let Some(url) = lookup("KV_CONNECTION") {
            config = config.connection_target(ConnectionTarget::from_url(&url)?);
        } else if let Some(project) = present("SPANNER_PROJECT") {
            config = config.connection_target(ConnectionTarget::Spanner {
                project,
                emulator_host: present("SPANNER_EMULATOR_HOST"),
            });
        }
        if let Some(placement) = lookup("KV_PLACEMENT") {
            config = config.placement(&placement);
        }
        if let Some(ms) = lookup("KV_OPERATION_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                format!(
                    "KV_OPERATION_TIMEOUT_MS must be a number of milliseconds, got '{}'",
                    ms
                )
            })?;
            config = config.operation_timeout(Duration::from_millis(ms));
        }

        Ok(config)
    }

    pub fn target(&self) -> ProvisionTarget {
        ProvisionTarget::new(&self.container_id, &self.database_id, &self.table_name)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.target().validate()?;

        if self.placement.is_empty() {
            return Err("placement cannot be empty".to_string());
        }

        for (name, timeout) in [
            ("provision_timeout", self.provision_timeout),
            ("operation_timeout", self.operation_timeout),
            ("health_timeout", self.health_timeout),
        ] {
            if timeout.is_zero() {
                return Err(format!("{} must be > 0", name));
            }
        }

        Ok(())
    }

    /// Open the shared backend handle for the configured target.
    pub async fn connect_backend(&self) -> Result<SharedBackend, BackendError> {
        match &self.connection_target {
            ConnectionTarget::Memory => Ok(Arc::new(MemoryBackend::new())),
            ConnectionTarget::File(path) => Ok(Arc::new(MemoryBackend::open(path)?)),
            ConnectionTarget::Spanner {
                project,
                emulator_host,
            } => connect_spanner(project, emulator_host.as_deref()).await,
        }
    }
}

#[cfg(feature = "spanner")]
async fn connect_spanner(
    project: &str,
    emulator_host: Option<&str>,
) -> Result<SharedBackend, BackendError> {
    let backend = crate::backend::spanner::SpannerBackend::connect(project, emulator_host).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "spanner"))]
async fn connect_spanner(
    project: &str,
    _emulator_host: Option<&str>,
) -> Result<SharedBackend, BackendError> {
    Err(BackendError::FailedPrecondition(format!(
        "spanner://{} needs the 'spanner' cargo feature",
        project
    )))
}
