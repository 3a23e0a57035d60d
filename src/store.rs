use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{event, Level};

use crate::backend::{Column, Filter, Mutation, SharedBackend, Statement};
use crate::config::ServiceConfig;
use crate::core::deadline::within;
use crate::core::{DatabasePath, DecodeError, Record, RecordKey, Row, StoreError, Value};

/// Whether an upsert created the record or replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub kind: WriteKind,
    pub commit_timestamp: DateTime<Utc>,
}

/// Upsert and point reads against the record table.
#[derive(Clone)]
pub struct RecordStore {
    backend: SharedBackend,
    database: DatabasePath,
    table: String,
    timeout: Duration,
}

impl RecordStore {
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

    /// Insert or replace the record under `key`.
    ///
    /// The row is read inside a locking transaction first: an absent key is
    /// inserted with both timestamps set to the commit timestamp, a present
    /// one only has `data` and `updated_at` rewritten.
    pub async fn upsert(&self, key: &RecordKey, value: JsonValue) -> Result<WriteReceipt, StoreError> {
        let receipt = within(self.timeout, self.upsert_in_transaction(key, value))
            .await
            .ok_or(StoreError::Timeout(self.timeout))?;

        match &receipt {
            Ok(receipt) => event!(
                Level::DEBUG,
                key = %key,
                kind = ?receipt.kind,
                commit_ts = %receipt.commit_timestamp.to_rfc3339(),
                "record written"
            ),
            Err(err) => event!(Level::ERROR, key = %key, error = %err, "record write failed"),
        }
        receipt
    }

    async fn upsert_in_transaction(
        &self,
        key: &RecordKey,
        value: JsonValue,
    ) -> Result<WriteReceipt, StoreError> {
        let mut tx = self.backend.begin(&self.database).await?;
        let existing = tx
            .read_row(&self.table, key.as_str(), &[Column::Id])
            .await?;

        let (kind, mutation) = match existing {
            Some(_) => (
                WriteKind::Updated,
                Mutation::Update {
                    table: self.table.clone(),
                    columns: vec![Column::Id, Column::Data, Column::UpdatedAt],
                    values: vec![
                        Value::from(key.as_str()),
                        Value::Json(value),
                        Value::CommitTimestamp,
                    ],
                },
            ),
            None => (
                WriteKind::Inserted,
                Mutation::Insert {
                    table: self.table.clone(),
                    columns: Column::ALL.to_vec(),
                    values: vec![
                        Value::from(key.as_str()),
                        Value::Json(value),
                        Value::CommitTimestamp,
                        Value::CommitTimestamp,
                    ],
                },
            ),
        };

        let commit_timestamp = tx.commit(vec![mutation]).await?;
        Ok(WriteReceipt {
            kind,
            commit_timestamp,
        })
    }

    /// Current record under `key`, or `None` if it was never written.
    pub async fn read(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let statement = Statement::select(&self.table, &Column::ALL)
            .filter(Filter::equals(Column::Id, "key"))
            .bind("key", key.as_str());

        let rows = within(self.timeout, async {
            let tx = self.backend.single_use(&self.database).await?;
            tx.query(&statement).await
        })
        .await
        .ok_or(StoreError::Timeout(self.timeout))??;

        let record = rows.first().map(decode_record).transpose()?;
        event!(Level::DEBUG, key = %key, found = record.is_some(), "record read");
        Ok(record)
    }
}

/// Decode a row projected over all four record columns.
pub(crate) fn decode_record(row: &Row) -> Result<Record, DecodeError> {
    let raw_key = row.string(Column::Id.name())?;
    let key = RecordKey::parse(raw_key).map_err(|err| DecodeError {
        column: Column::Id.name().to_string(),
        reason: err.to_string(),
    })?;

    Ok(Record {
        key,
        value: row.json(Column::Data.name())?.clone(),
        created_at: row.timestamp(Column::CreatedAt.name())?,
        updated_at: row.timestamp(Column::UpdatedAt.name())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::provision::Provisioner;
    use serde_json::json;
    use std::sync::Arc;

    async fn store() -> RecordStore {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let config = ServiceConfig::new("kv", "kvdb");
        Provisioner::from_config(Arc::clone(&backend), &config)
            .ensure_ready(&config.target())
            .await
            .unwrap();
        RecordStore::from_config(backend, &config)
    }

    #[tokio::test]
    async fn test_read_of_unwritten_key_is_none() {
        let store = store().await;
        assert!(store.read(&RecordKey::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_preserves_created_at() {
        let store = store().await;
        let key = RecordKey::new_v4();

        let first = store.upsert(&key, json!({"v": 1})).await.unwrap();
        assert_eq!(first.kind, WriteKind::Inserted);
        let second = store.upsert(&key, json!([2])).await.unwrap();
        assert_eq!(second.kind, WriteKind::Updated);

        let record = store.read(&key).await.unwrap().unwrap();
        assert_eq!(record.value, json!([2]));
        assert_eq!(record.created_at, first.commit_timestamp);
        assert_eq!(record.updated_at, second.commit_timestamp);
        assert!(record.updated_at > record.created_at);
    }

    #[tokio::test]
    async fn test_scalar_payloads_round_trip() {
        let store = store().await;
        for value in [json!(null), json!("text"), json!(3.5), json!(false)] {
            let key = RecordKey::new_v4();
            store.upsert(&key, value.clone()).await.unwrap();
            assert_eq!(store.read(&key).await.unwrap().unwrap().value, value);
        }
    }

    #[tokio::test]
    async fn test_missing_table_is_a_backend_error() {
        let backend: SharedBackend = Arc::new(MemoryBackend::new());
        let config = ServiceConfig::new("kv", "kvdb");
        Provisioner::from_config(Arc::clone(&backend), &config)
            .ensure_ready(&config.target())
            .await
            .unwrap();
        let store = RecordStore::new(
            backend,
            config.target().database_path(),
            "missing",
            Duration::from_secs(1),
        );

        let err = store.upsert(&RecordKey::new_v4(), json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(e) if e.is_not_found()));
    }
}
