//! Durable key-value storage for cache warm-start
//!
//! The cache persists one serialized snapshot blob under a string key and
//! reloads it on construction. Backends only need to store opaque strings.
//!
//! - **sqlite**: single-table SQLite store (default)
//! - **json_file**: one JSON file per key in a directory
//! - **memory**: process-local map, for tests and ephemeral use

mod json_file;
mod memory;
mod sqlite;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreConfig};

use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::Result;
use std::sync::Arc;

/// String-keyed durable storage
pub trait PersistenceAdapter: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key` if present
    fn remove(&self, key: &str) -> Result<()>;
}

/// Build the adapter selected by configuration
pub fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn PersistenceAdapter>> {
    let store: Arc<dyn PersistenceAdapter> = match config.backend {
        PersistenceBackend::Sqlite => Arc::new(SqliteStore::new(SqliteStoreConfig {
            path: config.path.clone(),
            wal_mode: config.wal_mode,
        })?),
        PersistenceBackend::JsonFile => Arc::new(JsonFileStore::new(&config.path)?),
        PersistenceBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
