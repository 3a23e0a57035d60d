use std::time::Duration;
use tracing::{event, Level};

use crate::backend::{SharedBackend, Statement};
use crate::config::ServiceConfig;
use crate::core::deadline::within;
use crate::core::{DatabasePath, HealthStatus};

/// Reachability check: a `SELECT 1` round trip with a short deadline.
#[derive(Clone)]
pub struct HealthProbe {
    backend: SharedBackend,
    database: DatabasePath,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(backend: SharedBackend, database: DatabasePath, timeout: Duration) -> Self {
        Self {
            backend,
            database,
            timeout,
        }
    }

    pub fn from_config(backend: SharedBackend, config: &ServiceConfig) -> Self {
        Self::new(backend, config.target().database_path(), config.health_timeout)
    }

    /// Never fails; every problem becomes `Unhealthy` with its description.
    pub async fn check(&self) -> HealthStatus {
        let probe = within(self.timeout, async {
            let tx = self.backend.single_use(&self.database).await?;
            tx.query(&Statement::ping()).await
        })
        .await;

        let status = match probe {
            Some(Ok(_)) => HealthStatus::Healthy,
            Some(Err(err)) => HealthStatus::Unhealthy(err.to_string()),
            None => HealthStatus::Unhealthy(format!(
                "health check timed out after {:?}",
                self.timeout
            )),
        };

        if let HealthStatus::Unhealthy(reason) = &status {
            event!(Level::WARN, database = %self.database, reason = %reason, "backing store unhealthy");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::provision::Provisioner;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_provisioned_store_is_healthy() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let config = ServiceConfig::new("kv", "kvdb");
        Provisioner::from_config(Arc::clone(&backend), &config)
            .ensure_ready(&config.target())
            .await
            .unwrap();

        let probe = HealthProbe::from_config(backend, &config);
        assert_eq!(probe.check().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_missing_database_is_unhealthy_not_fatal() {
        let probe = HealthProbe::new(
            Arc::new(MemoryBackend::new()),
            DatabasePath::new("kv", "kvdb"),
            Duration::from_secs(1),
        );
        match probe.check().await {
            HealthStatus::Unhealthy(reason) => assert!(reason.contains("not found")),
            HealthStatus::Healthy => panic!("expected unhealthy"),
        }
    }
}
