use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{event, Level};

use super::builder::ListQueryBuilder;
use super::params::{ListParams, RawListParams};
use crate::backend::{SharedBackend, COUNT_COLUMN};
use crate::config::ServiceConfig;
use crate::core::deadline::within;
use crate::core::{DatabasePath, DecodeError, QueryError, QueryPhase, Record};
use crate::store::decode_record;

/// One page of a listing plus the size of the whole filtered population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPage {
    #[serde(rename = "data")]
    pub records: Vec<Record>,
    pub total_count: i64,
}

/// Runs filtered, sorted, paginated scans and the matching count.
#[derive(Clone)]
pub struct ListEngine {
    backend: SharedBackend,
    database: DatabasePath,
    table: String,
    timeout: Duration,
}

impl ListEngine {
    pub fn new(
        backend: SharedBackend,
        database: DatabasePath,
        table: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            database,
            table: table.into(),
            timeout,
        }
    }

    pub fn from_config(backend: SharedBackend, config: &ServiceConfig) -> Self {
        Self::new(
            backend,
            config.target().database_path(),
            config.table_name.clone(),
            config.operation_timeout,
        )
    }

    /// Validate raw parameters and list. Invalid input never reaches the
    /// backend.
    pub async fn list_raw(&self, raw: &RawListParams) -> Result<ListPage, QueryError> {
        let params = ListParams::from_raw(raw)?;
        self.list(&params).await
    }

    /// Fetch one page and the filtered count from the same snapshot. Either
    /// both succeed or the call fails.
    pub async fn list(&self, params: &ListParams) -> Result<ListPage, QueryError> {
        let builder = ListQueryBuilder::new(&self.table);
        let data = builder.data_statement(params);
        let count = builder.count_statement(&params.filter);

        let fetched = within(self.timeout, async {
            let tx = self
                .backend
                .single_use(&self.database)
                .await
                .map_err(|source| QueryError::Backend {
                    phase: QueryPhase::Snapshot,
                    source,
                })?;

            tokio::try_join!(
                async {
                    tx.query(&data).await.map_err(|source| QueryError::Backend {
                        phase: QueryPhase::Fetch,
                        source,
                    })
                },
                async {
                    tx.query(&count).await.map_err(|source| QueryError::Backend {
                        phase: QueryPhase::Count,
                        source,
                    })
                },
            )
        })
        .await
        .ok_or(QueryError::Timeout(self.timeout));

        let (rows, count_rows) = match fetched.and_then(|inner| inner) {
            Ok(result) => result,
            Err(err) => {
                event!(Level::ERROR, statement = %data, error = %err, "list failed");
                return Err(err);
            }
        };

        let records = rows
            .iter()
            .map(decode_record)
            .collect::<Result<Vec<_>, _>>()?;
        let total_count = count_rows
            .first()
            .ok_or_else(|| DecodeError {
                column: COUNT_COLUMN.to_string(),
                reason: "count query returned no rows".to_string(),
            })?
            .int64(COUNT_COLUMN)?;

        event!(
            Level::DEBUG,
            statement = %data,
            returned = records.len(),
            total_count,
            sort = %params.sort,
            prefix = ?params.filter.as_prefix(),
            "listed records"
        );

        Ok(ListPage {
            records,
            total_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InvalidInput, RecordKey};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_list_page_serialization() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let page = ListPage {
            records: vec![Record {
                key: RecordKey::parse("550e8400-e29b-41d4-a716-446655440000").unwrap(),
                value: json!({"a": 1}),
                created_at: ts,
                updated_at: ts,
            }],
            total_count: 7,
        };

        assert_eq!(
            serde_json::to_value(&page).unwrap(),
            json!({
                "data": [{
                    "key": "550e8400-e29b-41d4-a716-446655440000",
                    "value": {"a": 1},
                    "created_at": "2024-05-01T12:00:00Z",
                    "updated_at": "2024-05-01T12:00:00Z"
                }],
                "total_count": 7
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_sort_is_rejected_before_the_backend() {
        let engine = ListEngine::new(
            std::sync::Arc::new(crate::backend::MemoryBackend::new()),
            DatabasePath::new("missing", "missing"),
            "kv_store",
            Duration::from_secs(1),
        );
        let raw = RawListParams {
            sort: Some("bogus".into()),
            ..Default::default()
        };
        let err = engine.list_raw(&raw).await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::InvalidInput(InvalidInput::UnknownSort { .. })
        ));
    }
}
