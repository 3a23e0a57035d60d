use chrono::{DateTime, Utc};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::statement::Column;
use crate::core::{BackendError, BackendResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// `STRING(n)`; `None` is `STRING(MAX)`.
    String(Option<usize>),
    Json,
    Timestamp,
    Int64,
    Bool,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(Some(len)) => write!(f, "STRING({})", len),
            Self::String(None) => write!(f, "STRING(MAX)"),
            Self::Json => write!(f, "JSON"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::Int64 => write!(f, "INT64"),
            Self::Bool => write!(f, "BOOL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
    pub allow_commit_timestamp: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            allow_commit_timestamp: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn commit_timestamp(mut self) -> Self {
        self.allow_commit_timestamp = true;
        self
    }

    /// Resolve the commit-timestamp placeholder and type-check the value.
    pub fn admit(&self, value: &Value, commit_ts: DateTime<Utc>) -> BackendResult<Value> {
        let value = match value {
            Value::CommitTimestamp => {
                if self.data_type != ColumnType::Timestamp || !self.allow_commit_timestamp {
                    return Err(BackendError::FailedPrecondition(format!(
                        "column '{}' does not allow commit timestamps",
                        self.name
                    )));
                }
                Value::Timestamp(commit_ts)
            }
            other => other.clone(),
        };

        match (&self.data_type, &value) {
            (_, Value::Null) if !self.nullable => Err(BackendError::FailedPrecondition(format!(
                "column '{}' cannot be NULL",
                self.name
            ))),
            (_, Value::Null) => Ok(value),
            (ColumnType::String(max), Value::String(s)) => match max {
                Some(max) if s.chars().count() > *max => Err(BackendError::FailedPrecondition(
                    format!(
                        "value of length {} exceeds column '{}' limit {}",
                        s.chars().count(),
                        self.name,
                        max
                    ),
                )),
                _ => Ok(value),
            },
            (ColumnType::Json, Value::Json(_))
            | (ColumnType::Timestamp, Value::Timestamp(_))
            | (ColumnType::Int64, Value::Int64(_))
            | (ColumnType::Bool, Value::Bool(_)) => Ok(value),
            (expected, got) => Err(BackendError::InvalidArgument(format!(
                "column '{}' expects {}, got {}",
                self.name,
                expected,
                got.type_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: String,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        primary_key: impl Into<String>,
    ) -> BackendResult<Self> {
        let name = name.into();
        let primary_key = primary_key.into();

        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(BackendError::InvalidArgument(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, name
                )));
            }
        }

        let key_column = columns
            .iter()
            .find(|c| c.name == primary_key)
            .ok_or_else(|| {
                BackendError::InvalidArgument(format!(
                    "primary key '{}' is not a column of '{}'",
                    primary_key, name
                ))
            })?;
        if !matches!(key_column.data_type, ColumnType::String(_)) {
            return Err(BackendError::InvalidArgument(format!(
                "primary key '{}' must be a STRING column",
                primary_key
            )));
        }

        Ok(Self {
            name,
            columns,
            primary_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn require_column(&self, name: &str) -> BackendResult<usize> {
        self.column_index(name).ok_or_else(|| {
            BackendError::InvalidArgument(format!(
                "column '{}' not found in table '{}'",
                name, self.name
            ))
        })
    }
}

/// Catalog key for a table name. Table names resolve case-insensitively,
/// so `KV_STORE` and `kv_store` are the same table.
pub fn table_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// A table's rows keyed by primary key. Cloning is O(1), so a read
/// snapshot is just a clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    schema: TableSchema,
    rows: OrdMap<String, Vec<Value>>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: OrdMap::new(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, key: &str) -> Option<&Vec<Value>> {
        self.rows.get(key)
    }

    /// Rows in primary-key order.
    pub fn scan(&self) -> impl Iterator<Item = (&String, &Vec<Value>)> {
        self.rows.iter()
    }

    fn resolve_columns(&self, columns: &[Column]) -> BackendResult<Vec<usize>> {
        let mut seen = Vec::with_capacity(columns.len());
        for column in columns {
            let idx = self.schema.require_column(column.name())?;
            if seen.contains(&idx) {
                return Err(BackendError::InvalidArgument(format!(
                    "column '{}' written twice",
                    column
                )));
            }
            seen.push(idx);
        }
        Ok(seen)
    }

    fn key_of(&self, positions: &[usize], values: &[Value]) -> BackendResult<String> {
        let key_idx = self
            .schema
            .column_index(&self.schema.primary_key)
            .ok_or_else(|| BackendError::Internal("primary key column vanished".into()))?;
        positions
            .iter()
            .position(|p| *p == key_idx)
            .and_then(|i| values.get(i))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::InvalidArgument(format!(
                    "mutation on '{}' must set primary key '{}'",
                    self.schema.name, self.schema.primary_key
                ))
            })
    }

    pub fn insert(
        &mut self,
        columns: &[Column],
        values: &[Value],
        commit_ts: DateTime<Utc>,
    ) -> BackendResult<()> {
        check_arity(columns, values)?;
        let positions = self.resolve_columns(columns)?;
        let key = self.key_of(&positions, values)?;
        if self.rows.contains_key(&key) {
            return Err(BackendError::AlreadyExists(format!(
                "row '{}' in table '{}'",
                key, self.schema.name
            )));
        }

        let mut row = vec![Value::Null; self.schema.columns.len()];
        for (pos, value) in positions.iter().zip(values) {
            row[*pos] = value.clone();
        }
        let admitted = self
            .schema
            .columns
            .iter()
            .zip(row.iter())
            .map(|(def, value)| def.admit(value, commit_ts))
            .collect::<BackendResult<Vec<_>>>()?;

        self.rows.insert(key, admitted);
        Ok(())
    }

    pub fn update(
        &mut self,
        columns: &[Column],
        values: &[Value],
        commit_ts: DateTime<Utc>,
    ) -> BackendResult<()> {
        check_arity(columns, values)?;
        let positions = self.resolve_columns(columns)?;
        let key = self.key_of(&positions, values)?;
        let mut row = self.rows.get(&key).cloned().ok_or_else(|| {
            BackendError::NotFound(format!("row '{}' in table '{}'", key, self.schema.name))
        })?;

        for (pos, value) in positions.iter().zip(values) {
            row[*pos] = self.schema.columns[*pos].admit(value, commit_ts)?;
        }

        self.rows.insert(key, row);
        Ok(())
    }
}

fn check_arity(columns: &[Column], values: &[Value]) -> BackendResult<()> {
    if columns.len() != values.len() {
        return Err(BackendError::InvalidArgument(format!(
            "expected {} values, got {}",
            columns.len(),
            values.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_key_folds_case() {
        assert_eq!(table_key("KV_Store"), table_key("kv_store"));
        assert_ne!(table_key("kv_store"), table_key("kv_store2"));
    }

    fn kv_table() -> Table {
        let schema = TableSchema::new(
            "kv_store",
            vec![
                ColumnDef::new("id", ColumnType::String(Some(36))).not_null(),
                ColumnDef::new("data", ColumnType::Json).not_null(),
                ColumnDef::new("created_at", ColumnType::Timestamp)
                    .not_null()
                    .commit_timestamp(),
                ColumnDef::new("updated_at", ColumnType::Timestamp)
                    .not_null()
                    .commit_timestamp(),
            ],
            "id",
        )
        .unwrap();
        Table::new(schema)
    }

    #[test]
    fn test_insert_resolves_commit_timestamp() {
        let mut table = kv_table();
        let ts = Utc::now();
        table
            .insert(
                &Column::ALL,
                &[
                    Value::from("k"),
                    Value::Json(json!({"a": 1})),
                    Value::CommitTimestamp,
                    Value::CommitTimestamp,
                ],
                ts,
            )
            .unwrap();

        let row = table.get("k").unwrap();
        assert_eq!(row[2], Value::Timestamp(ts));
        assert_eq!(row[3], Value::Timestamp(ts));
    }

    #[test]
    fn test_insert_rejects_missing_not_null_columns() {
        let mut table = kv_table();
        let err = table
            .insert(
                &[Column::Id, Column::Data],
                &[Value::from("k"), Value::Json(json!(1))],
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, BackendError::FailedPrecondition(_)));
        assert_eq!(table.row_count(), 0);
    }

    #[test]
    fn test_duplicate_insert_is_already_exists() {
        let mut table = kv_table();
        let values = [
            Value::from("k"),
            Value::Json(json!(1)),
            Value::CommitTimestamp,
            Value::CommitTimestamp,
        ];
        table.insert(&Column::ALL, &values, Utc::now()).unwrap();
        let err = table.insert(&Column::ALL, &values, Utc::now()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_update_keeps_unlisted_columns() {
        let mut table = kv_table();
        let first = Utc::now();
        table
            .insert(
                &Column::ALL,
                &[
                    Value::from("k"),
                    Value::Json(json!(1)),
                    Value::CommitTimestamp,
                    Value::CommitTimestamp,
                ],
                first,
            )
            .unwrap();

        let second = first + chrono::Duration::seconds(1);
        table
            .update(
                &[Column::Id, Column::Data, Column::UpdatedAt],
                &[Value::from("k"), Value::Json(json!(2)), Value::CommitTimestamp],
                second,
            )
            .unwrap();

        let row = table.get("k").unwrap();
        assert_eq!(row[1], Value::Json(json!(2)));
        assert_eq!(row[2], Value::Timestamp(first));
        assert_eq!(row[3], Value::Timestamp(second));
    }

    #[test]
    fn test_update_of_missing_row_is_not_found() {
        let mut table = kv_table();
        let err = table
            .update(
                &[Column::Id, Column::Data],
                &[Value::from("nope"), Value::Json(json!(1))],
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_string_length_and_type_checks() {
        let mut table = kv_table();
        let long_key = "k".repeat(37);
        let err = table
            .insert(
                &Column::ALL,
                &[
                    Value::from(long_key.as_str()),
                    Value::Json(json!(1)),
                    Value::CommitTimestamp,
                    Value::CommitTimestamp,
                ],
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, BackendError::FailedPrecondition(_)));

        let err = table
            .insert(
                &Column::ALL,
                &[
                    Value::from("k"),
                    Value::from("not json"),
                    Value::CommitTimestamp,
                    Value::CommitTimestamp,
                ],
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidArgument(_)));
    }

    #[test]
    fn test_snapshot_clone_is_isolated() {
        let mut table = kv_table();
        let snapshot = table.clone();
        table
            .insert(
                &Column::ALL,
                &[
                    Value::from("k"),
                    Value::Json(json!(1)),
                    Value::CommitTimestamp,
                    Value::CommitTimestamp,
                ],
                Utc::now(),
            )
            .unwrap();
        assert_eq!(snapshot.row_count(), 0);
        assert_eq!(table.row_count(), 1);
    }
}
