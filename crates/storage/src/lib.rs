//! Key-value storage backends used by the ledger migration engine.
//!
//! Every backend exposes the same flat, ordered keyspace through
//! [`StorageBackend`]. Sources are opened read-only, destinations read-write.

pub mod api;
pub mod backend;
pub mod error;

use std::{fmt, path::Path, str::FromStr, sync::Arc};

pub use api::{KeyValueIter, KeyValuePair, StorageBackend, StorageWriteBatch, prefix_iter};
pub use backend::in_memory::InMemoryBackend;
#[cfg(feature = "rocksdb")]
pub use backend::rocksdb::RocksDBBackend;
pub use error::StoreError;

/// Storage backend type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    /// In-memory storage, non-persistent. Suitable for testing.
    InMemory,
    /// RocksDB storage, persistent. Also reads Geth Pebble directories.
    #[cfg(feature = "rocksdb")]
    RocksDB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::InMemory => write!(f, "memory"),
            #[cfg(feature = "rocksdb")]
            EngineType::RocksDB => write!(f, "rocksdb"),
        }
    }
}

impl FromStr for EngineType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" | "in-memory" => Ok(EngineType::InMemory),
            #[cfg(feature = "rocksdb")]
            "rocksdb" | "pebble" => Ok(EngineType::RocksDB),
            other => Err(StoreError::Custom(format!("Unknown storage engine: {other}"))),
        }
    }
}

/// Opens a store at `path` with the given engine.
///
/// In-memory stores ignore the path and always start empty.
pub fn open_backend(
    path: &Path,
    engine: EngineType,
    mode: OpenMode,
) -> Result<Arc<dyn StorageBackend>, StoreError> {
    match (engine, mode) {
        (EngineType::InMemory, _) => Ok(Arc::new(InMemoryBackend::new())),
        #[cfg(feature = "rocksdb")]
        (EngineType::RocksDB, OpenMode::ReadOnly) => {
            Ok(Arc::new(RocksDBBackend::open_read_only(path)?))
        }
        #[cfg(feature = "rocksdb")]
        (EngineType::RocksDB, OpenMode::ReadWrite) => Ok(Arc::new(RocksDBBackend::open(path)?)),
    }
}
