use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDB(#[from] rocksdb::Error),
    #[error("Store at {0} was opened read-only")]
    ReadOnly(String),
    #[error("Lock poisoned")]
    LockError,
    #[error("{0}")]
    Custom(String),
}
