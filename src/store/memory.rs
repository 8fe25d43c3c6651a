//! In-memory store.
//!
//! One `RwLock` guards every table, so the lock is the transactional
//! boundary for each atomic operation.

use crate::store::tables::{TableAccess, Tables};
use crate::TollgateError;
use std::sync::RwLock;

/// Process-local entitlement store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current tables.
    pub fn snapshot(&self) -> Result<Tables, TollgateError> {
        self.read(Tables::clone)
    }
}

impl TableAccess for MemoryStore {
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
        f(&mut guard)
    }
}
