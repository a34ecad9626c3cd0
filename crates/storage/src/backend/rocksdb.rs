//! RocksDB backend.
//!
//! Read-only handles are opened with `open_for_read_only`, which takes no
//! lock on the database directory: a node still writing to the same store is
//! not blocked, and the handle sees the data as of the moment it was opened.
//! Geth Pebble directories open the same way in most cases, since both share
//! the SSTable layout.

use std::{path::Path, sync::Arc};

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use tracing::debug;

use crate::{
    api::{KeyValueIter, StorageBackend, StorageWriteBatch},
    error::StoreError,
};

type Db = DBWithThreadMode<MultiThreaded>;

#[derive(Debug, Clone)]
pub struct RocksDBBackend {
    db: Arc<Db>,
    path: String,
    read_only: bool,
}

impl RocksDBBackend {
    /// Opens (or creates) a store for reading and writing.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(4);

        let db = Db::open(&opts, path)?;
        debug!(path = %path.display(), "Opened RocksDB store read-write");
        Ok(Self {
            db: Arc::new(db),
            path: path.display().to_string(),
            read_only: false,
        })
    }

    /// Opens an existing store without taking the writer lock.
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.set_disable_auto_compactions(true);
        opts.set_allow_mmap_reads(true);
        opts.set_max_background_jobs(4);

        let db = Db::open_for_read_only(&opts, path, false)?;
        debug!(path = %path.display(), "Opened RocksDB store read-only");
        Ok(Self {
            db: Arc::new(db),
            path: path.display().to_string(),
            read_only: true,
        })
    }
}

impl StorageBackend for RocksDBBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?)
    }

    fn iter_from(&self, start: &[u8]) -> Result<KeyValueIter<'_>, StoreError> {
        let iter = self
            .db
            .iterator(IteratorMode::From(start, Direction::Forward))
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.into_vec(), value.into_vec()))
                    .map_err(StoreError::from)
            });
        Ok(Box::new(iter))
    }

    fn begin_write(&self) -> Result<Box<dyn StorageWriteBatch>, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }
        Ok(Box::new(RocksDBWriteBatch {
            db: self.db.clone(),
            batch: WriteBatch::default(),
        }))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

struct RocksDBWriteBatch {
    db: Arc<Db>,
    batch: WriteBatch,
}

impl StorageWriteBatch for RocksDBWriteBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.batch.put(key, value);
        Ok(())
    }

    fn len(&self) -> usize {
        self.batch.len()
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { db, batch } = *self;
        db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_store(dir: &Path) {
        let backend = RocksDBBackend::open(dir).unwrap();
        let mut batch = backend.begin_write().unwrap();
        batch.put(b"h\x00", b"genesis_header").unwrap();
        batch.put(b"h\x01", b"block_1_header").unwrap();
        batch.put(b"b\x01", b"block_1_body").unwrap();
        assert_eq!(batch.len(), 3);
        batch.commit().unwrap();
    }

    #[test]
    fn reads_committed_keys_through_read_only_handle() {
        let temp_dir = TempDir::new().unwrap();
        seeded_store(temp_dir.path());

        let reader = RocksDBBackend::open_read_only(temp_dir.path()).unwrap();
        assert_eq!(
            reader.get(b"h\x01").unwrap(),
            Some(b"block_1_header".to_vec())
        );
        assert!(reader.contains(b"b\x01").unwrap());
        assert!(!reader.contains(b"missing").unwrap());
    }

    #[test]
    fn iterates_forward_from_seek_key() {
        let temp_dir = TempDir::new().unwrap();
        seeded_store(temp_dir.path());

        let reader = RocksDBBackend::open_read_only(temp_dir.path()).unwrap();
        let keys: Vec<_> = reader
            .iter_from(b"h")
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"h\x00".to_vec(), b"h\x01".to_vec()]);
    }

    #[test]
    fn read_only_handle_refuses_batches() {
        let temp_dir = TempDir::new().unwrap();
        seeded_store(temp_dir.path());

        let reader = RocksDBBackend::open_read_only(temp_dir.path()).unwrap();
        assert!(matches!(reader.begin_write(), Err(StoreError::ReadOnly(_))));
    }

    #[test]
    fn fails_on_nonexistent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(RocksDBBackend::open_read_only(&missing).is_err());
    }
}
