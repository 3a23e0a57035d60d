//! Startup provisioning of the container, database and table.
//!
//! Every step checks before it creates, and an `AlreadyExists` answer from a
//! create call counts as success, so a failed run can simply be repeated.

use std::future::Future;
use std::time::Duration;
use tracing::{event, info_span, Instrument, Level};

use crate::backend::ddl::declared_table;
use crate::backend::{ContainerSpec, Dialect, SharedBackend};
use crate::config::ServiceConfig;
use crate::core::deadline::within;
use crate::core::{
    BackendError, BackendResult, ProvisionError, ProvisionOutcome, ProvisionReport,
    ProvisionTarget, ResourceKind,
};

/// Render the record table DDL for `table_name`.
pub fn table_ddl(table_name: &str) -> String {
    format!(
        "CREATE TABLE {} (\n    \
         id STRING(36) NOT NULL,\n    \
         data JSON NOT NULL,\n    \
         created_at TIMESTAMP NOT NULL OPTIONS (allow_commit_timestamp=true),\n    \
         updated_at TIMESTAMP NOT NULL OPTIONS (allow_commit_timestamp=true)\n\
         ) PRIMARY KEY (id)",
        table_name
    )
}

pub struct Provisioner {
    backend: SharedBackend,
    placement: String,
    step_timeout: Duration,
}

impl Provisioner {
    pub fn new(backend: SharedBackend, placement: impl Into<String>, step_timeout: Duration) -> Self {
        Self {
            backend,
            placement: placement.into(),
            step_timeout,
        }
    }

    pub fn from_config(backend: SharedBackend, config: &ServiceConfig) -> Self {
        Self::new(backend, config.placement.clone(), config.provision_timeout)
    }

    /// Make sure the container, database and table exist, creating only
    /// what is missing.
    pub async fn ensure_ready(
        &self,
        target: &ProvisionTarget,
    ) -> Result<ProvisionReport, ProvisionError> {
        target.validate().map_err(ProvisionError::InvalidTarget)?;

        let span = info_span!(
            "provision",
            container = %target.container_id,
            database = %target.database_id,
            table = %target.table_name
        );

        async {
            let container = self.ensure_container(target).await?;
            let database = self.ensure_database(target).await?;
            let table = self.ensure_table(target).await?;
            Ok::<_, ProvisionError>(ProvisionReport {
                container,
                database,
                table,
            })
        }
        .instrument(span)
        .await
    }

    async fn ensure_container(
        &self,
        target: &ProvisionTarget,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let kind = ResourceKind::Container;
        let name = target.container_id.as_str();

        let found = self
            .bounded(kind, name, self.backend.get_container(name))
            .await?;
        let outcome = match found {
            Ok(_) => ProvisionOutcome::AlreadyExisted,
            Err(err) if err.is_not_found() => {
                let spec = ContainerSpec::minimal(name, &self.placement);
                let created = self
                    .bounded(kind, name, self.backend.create_container(spec))
                    .await?;
                created_outcome(kind, name, created)?
            }
            Err(source) => return Err(check_failed(kind, name, source)),
        };

        report(kind, name, outcome);
        Ok(outcome)
    }

    async fn ensure_database(
        &self,
        target: &ProvisionTarget,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let kind = ResourceKind::Database;
        let path = target.database_path();
        let name = target.database_id.as_str();

        let found = self
            .bounded(kind, name, self.backend.get_database(&path))
            .await?;
        let outcome = match found {
            Ok(_) => ProvisionOutcome::AlreadyExisted,
            Err(err) if err.is_not_found() => {
                let created = self
                    .bounded(
                        kind,
                        name,
                        self.backend
                            .create_database(&path, Dialect::GoogleStandardSql),
                    )
                    .await?;
                created_outcome(kind, name, created)?
            }
            Err(source) => return Err(check_failed(kind, name, source)),
        };

        report(kind, name, outcome);
        Ok(outcome)
    }

    async fn ensure_table(
        &self,
        target: &ProvisionTarget,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let kind = ResourceKind::Table;
        let path = target.database_path();
        let name = target.table_name.as_str();

        let statements = self
            .bounded(kind, name, self.backend.database_ddl(&path))
            .await?
            .map_err(|source| check_failed(kind, name, source))?;

        let exists = statements.iter().any(|ddl| {
            declared_table(ddl).is_some_and(|declared| declared.eq_ignore_ascii_case(name))
        });

        let outcome = if exists {
            ProvisionOutcome::AlreadyExisted
        } else {
            let created = self
                .bounded(
                    kind,
                    name,
                    self.backend.update_ddl(&path, vec![table_ddl(name)]),
                )
                .await?;
            created_outcome(kind, name, created)?
        };

        report(kind, name, outcome);
        Ok(outcome)
    }

    /// Apply the step timeout. The outer error is the timeout, the inner
    /// result is whatever the backend answered.
    async fn bounded<T, F>(
        &self,
        kind: ResourceKind,
        name: &str,
        call: F,
    ) -> Result<BackendResult<T>, ProvisionError>
    where
        F: Future<Output = BackendResult<T>>,
    {
        within(self.step_timeout, call).await.ok_or_else(|| {
            event!(Level::ERROR, resource = %kind, name = %name, "provisioning step timed out");
            ProvisionError::Timeout {
                kind,
                name: name.to_string(),
                after: self.step_timeout,
            }
        })
    }
}

fn created_outcome(
    kind: ResourceKind,
    name: &str,
    created: BackendResult<()>,
) -> Result<ProvisionOutcome, ProvisionError> {
    match created {
        Ok(()) => Ok(ProvisionOutcome::Created),
        // Lost a race with another provisioner; the resource is there.
        Err(err) if err.is_already_exists() => Ok(ProvisionOutcome::AlreadyExisted),
        Err(source) => {
            event!(Level::ERROR, resource = %kind, name = %name, error = %source, "create failed");
            Err(ProvisionError::Create {
                kind,
                name: name.to_string(),
                source,
            })
        }
    }
}

fn check_failed(kind: ResourceKind, name: &str, source: BackendError) -> ProvisionError {
    event!(Level::ERROR, resource = %kind, name = %name, error = %source, "existence check failed");
    ProvisionError::Check {
        kind,
        name: name.to_string(),
        source,
    }
}

fn report(kind: ResourceKind, name: &str, outcome: ProvisionOutcome) {
    event!(
        Level::INFO,
        resource = %kind,
        name = %name,
        outcome = outcome.as_str(),
        "resource ready"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ddl::parse_create_table;
    use crate::backend::{Backend, MemoryBackend};
    use std::sync::Arc;

    fn provisioner(backend: &MemoryBackend) -> Provisioner {
        Provisioner::new(
            Arc::new(backend.clone()),
            "emulator-config",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_table_ddl_matches_fixed_schema() {
        assert_eq!(
            table_ddl("kv_store"),
            "CREATE TABLE kv_store (\n    \
             id STRING(36) NOT NULL,\n    \
             data JSON NOT NULL,\n    \
             created_at TIMESTAMP NOT NULL OPTIONS (allow_commit_timestamp=true),\n    \
             updated_at TIMESTAMP NOT NULL OPTIONS (allow_commit_timestamp=true)\n\
             ) PRIMARY KEY (id)"
        );
        let schema = parse_create_table(&table_ddl("documents")).unwrap();
        assert_eq!(schema.name(), "documents");
        assert_eq!(schema.primary_key(), "id");
    }

    #[tokio::test]
    async fn test_fresh_store_creates_everything() {
        let backend = MemoryBackend::new();
        let target = ProvisionTarget::new("kv", "kvdb", "kv_store");

        let report = provisioner(&backend).ensure_ready(&target).await.unwrap();
        assert_eq!(report.created_count(), 3);

        let info = backend.get_container("kv").await.unwrap();
        assert_eq!(info.placement, "emulator-config");
        assert_eq!(info.node_count, 1);
        let ddl = backend.database_ddl(&target.database_path()).await.unwrap();
        assert_eq!(ddl, vec![table_ddl("kv_store")]);
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let backend = MemoryBackend::new();
        let target = ProvisionTarget::new("kv", "kvdb", "kv_store");
        provisioner(&backend).ensure_ready(&target).await.unwrap();

        let report = provisioner(&backend).ensure_ready(&target).await.unwrap();
        assert!(report.all_existed());
        assert_eq!(
            backend.database_ddl(&target.database_path()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_partial_state_is_completed() {
        let backend = MemoryBackend::new();
        backend
            .create_container(ContainerSpec::minimal("kv", "emulator-config"))
            .await
            .unwrap();

        let target = ProvisionTarget::new("kv", "kvdb", "kv_store");
        let report = provisioner(&backend).ensure_ready(&target).await.unwrap();
        assert_eq!(report.container, ProvisionOutcome::AlreadyExisted);
        assert_eq!(report.database, ProvisionOutcome::Created);
        assert_eq!(report.table, ProvisionOutcome::Created);
    }

    #[tokio::test]
    async fn test_other_tables_do_not_count() {
        let backend = MemoryBackend::new();
        let target = ProvisionTarget::new("kv", "kvdb", "kv_store");
        provisioner(&backend)
            .ensure_ready(&ProvisionTarget::new("kv", "kvdb", "kv_store_archive"))
            .await
            .unwrap();

        let report = provisioner(&backend).ensure_ready(&target).await.unwrap();
        assert_eq!(report.table, ProvisionOutcome::Created);
    }

    #[tokio::test]
    async fn test_invalid_target_touches_nothing() {
        let backend = MemoryBackend::new();
        let err = provisioner(&backend)
            .ensure_ready(&ProvisionTarget::new("kv", "kvdb", "kv_store; DROP"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTarget(_)));
        assert!(backend.get_container("kv").await.unwrap_err().is_not_found());
    }
}
