//! File-backed store with atomic writes.
//!
//! Stores every table as one JSON document under
//! `dirs::data_dir()/<namespace>/entitlements.json`. Each committed
//! mutation is written with temp file + rename; if the write fails the
//! in-memory change is discarded.

use crate::store::tables::{TableAccess, Tables};
use crate::TollgateError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const STORE_FILE: &str = "entitlements.json";

/// Durable single-process entitlement store.
#[derive(Debug)]
pub struct FileStore {
    /// Path to the JSON document.
    path: PathBuf,
    /// Committed tables.
    tables: RwLock<Tables>,
}

impl FileStore {
    /// Open (or create) a store with the given namespace.
    ///
    /// Files are stored under `dirs::data_dir()/<namespace>/`.
    pub fn new(namespace: &str) -> Result<Self, TollgateError> {
        let base_dir = dirs::data_dir()
            .ok_or_else(|| TollgateError::StoreError("Could not find data directory".to_string()))?;
        Self::open(base_dir.join(namespace))
    }

    /// Open (or create) a store in a specific directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, TollgateError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| TollgateError::StoreError(format!("Failed to create store dir: {}", e)))?;

        let path = dir.join(STORE_FILE);
        let tables = if path.exists() {
            let json = fs::read_to_string(&path)
                .map_err(|e| TollgateError::StoreError(format!("Failed to read store: {}", e)))?;
            serde_json::from_str(&json)
                .map_err(|e| TollgateError::StoreError(format!("Failed to parse store: {}", e)))?
        } else {
            Tables::default()
        };

        Ok(Self {
            path,
            tables: RwLock::new(tables),
        })
    }

    /// Location of the JSON document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, tables: &Tables) -> Result<(), TollgateError> {
        let json = serde_json::to_string_pretty(tables)
            .map_err(|e| TollgateError::StoreError(format!("Failed to serialize: {}", e)))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .map_err(|e| TollgateError::StoreError(format!("Failed to write temp file: {}", e)))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| TollgateError::StoreError(format!("Failed to rename store file: {}", e)))?;

        Ok(())
    }
}

impl TableAccess for FileStore {
    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, TollgateError> {
        let guard = self
            .tables
            .read()
            .map_err(|_| TollgateError::StoreError("store lock poisoned".to_string()))?;
        Ok(f(&guard))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, TollgateError>,
    ) -> Result<T, TollgateError> {
        let mut guard = self
            .tables
            .write()
            .map_err(|_| TollgateError::StoreError("store lock poisoned".to_string()))?;

        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        self.persist(&staged)?;
        *guard = staged;
        Ok(out)
    }
}
