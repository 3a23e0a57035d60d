use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::InvalidInput;

/// Length of a hyphenated UUID, the only accepted key format.
pub const KEY_LENGTH: usize = 36;

/// Primary key of a record: a canonical (lowercase, hyphenated) UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    pub fn parse(raw: &str) -> Result<Self, InvalidInput> {
        if raw.len() != KEY_LENGTH {
            return Err(InvalidInput::MalformedKey(raw.to_string()));
        }
        let uuid = Uuid::parse_str(raw).map_err(|_| InvalidInput::MalformedKey(raw.to_string()))?;
        Ok(Self::from(uuid))
    }

    pub fn new_v4() -> Self {
        Self::from(Uuid::new_v4())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Uuid> for RecordKey {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.hyphenated().to_string())
    }
}

impl FromStr for RecordKey {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = InvalidInput;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored document with its bookkeeping timestamps.
///
/// Timestamps serialize as RFC 3339 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub value: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fully qualified name of a database inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabasePath {
    pub container: String,
    pub database: String,
}

impl DatabasePath {
    pub fn new(container: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "containers/{}/databases/{}", self.container, self.database)
    }
}

/// The three resources the service needs before it can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTarget {
    pub container_id: String,
    pub database_id: String,
    pub table_name: String,
}

impl ProvisionTarget {
    pub fn new(
        container_id: impl Into<String>,
        database_id: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            database_id: database_id.into(),
            table_name: table_name.into(),
        }
    }

    pub fn database_path(&self) -> DatabasePath {
        DatabasePath::new(&self.container_id, &self.database_id)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_resource_id("container_id", &self.container_id)?;
        validate_resource_id("database_id", &self.database_id)?;
        validate_table_name(&self.table_name)
    }
}

/// Container and database ids: lowercase letters, digits, `-` and `_`,
/// starting with a letter.
fn validate_resource_id(field: &str, id: &str) -> Result<(), String> {
    let mut chars = id.chars();
    match chars.next() {
        None => return Err(format!("{} cannot be empty", field)),
        Some(c) if !c.is_ascii_lowercase() => {
            return Err(format!("{} must start with a lowercase letter, got '{}'", field, id));
        }
        _ => {}
    }
    if id.len() > 64 {
        return Err(format!("{} must be at most 64 characters", field));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
        return Err(format!(
            "{} may only contain lowercase letters, digits, '-' and '_', got '{}'",
            field, id
        ));
    }
    Ok(())
}

/// Table names are interpolated into DDL and queries, so they must be plain
/// identifiers.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err("table_name cannot be empty".to_string()),
        Some(c) if !c.is_ascii_alphabetic() => {
            return Err(format!("table_name must start with a letter, got '{}'", name));
        }
        _ => {}
    }
    if name.len() > 128 {
        return Err("table_name must be at most 128 characters".to_string());
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "table_name may only contain letters, digits and '_', got '{}'",
            name
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Container,
    Database,
    Table,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Database => write!(f, "database"),
            Self::Table => write!(f, "table"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    AlreadyExisted,
    Created,
}

impl ProvisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyExisted => "already_existed",
            Self::Created => "created",
        }
    }
}

/// Per-resource result of [`crate::Provisioner::ensure_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub container: ProvisionOutcome,
    pub database: ProvisionOutcome,
    pub table: ProvisionOutcome,
}

impl ProvisionReport {
    pub fn created_count(&self) -> usize {
        [self.container, self.database, self.table]
            .iter()
            .filter(|outcome| **outcome == ProvisionOutcome::Created)
            .count()
    }

    pub fn all_existed(&self) -> bool {
        self.created_count() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}
