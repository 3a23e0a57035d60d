// ============================================================================
// Catalog snapshots
// ============================================================================
//
// File-backed emulator instances write the whole catalog after every DDL
// change and every commit. The image is MessagePack, written to a temp
// file in the target directory and renamed over the previous snapshot.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::table::Table;
use super::Dialect;
use crate::core::{BackendError, BackendResult};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerImage {
    pub id: String,
    pub placement: String,
    pub display_name: String,
    pub node_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseImage {
    pub container: String,
    pub database: String,
    pub dialect: Dialect,
    pub ddl: Vec<String>,
    pub tables: BTreeMap<String, Table>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogImage {
    pub version: u32,
    /// Last commit timestamp handed out, in microseconds.
    pub last_commit_micros: i64,
    pub containers: Vec<ContainerImage>,
    pub databases: Vec<DatabaseImage>,
}

impl CatalogImage {
    pub fn row_count(&self) -> usize {
        self.databases
            .iter()
            .flat_map(|db| db.tables.values())
            .map(Table::row_count)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, image: &CatalogImage) -> BackendResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| {
            BackendError::Unavailable(format!("failed to create snapshot directory: {}", e))
        })?;

        let serialized = rmp_serde::to_vec(image)
            .map_err(|e| BackendError::Internal(format!("failed to serialize snapshot: {}", e)))?;

        let mut temp = NamedTempFile::new_in(&dir)
            .map_err(|e| BackendError::Unavailable(format!("failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| BackendError::Unavailable(format!("failed to write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| BackendError::Unavailable(format!("failed to sync snapshot: {}", e)))?;
        temp.persist(&self.path)
            .map_err(|e| BackendError::Unavailable(format!("failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> BackendResult<Option<CatalogImage>> {
        if !self.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)
            .map_err(|e| BackendError::Unavailable(format!("failed to read snapshot: {}", e)))?;
        let image: CatalogImage = rmp_serde::from_slice(&data).map_err(|e| {
            BackendError::Internal(format!("failed to deserialize snapshot: {}", e))
        })?;
        if image.version != SNAPSHOT_VERSION {
            return Err(BackendError::FailedPrecondition(format!(
                "snapshot version {} is not supported (expected {})",
                image.version, SNAPSHOT_VERSION
            )));
        }
        Ok(Some(image))
    }
}
