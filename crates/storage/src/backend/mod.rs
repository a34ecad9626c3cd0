pub mod in_memory;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
