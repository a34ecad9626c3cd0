use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    api::{KeyValueIter, StorageBackend, StorageWriteBatch},
    error::StoreError,
};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Non-persistent backend, used for tests and dry runs against missing stores.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    table: Arc<RwLock<Table>>,
    commits: Arc<Mutex<Vec<usize>>>,
    read_only: bool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a read-only handle over the same data.
    pub fn read_only(&self) -> Self {
        Self {
            table: self.table.clone(),
            commits: self.commits.clone(),
            read_only: true,
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.table.read().map_err(|_| StoreError::LockError)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Sizes (in puts) of every batch committed so far, oldest first.
    pub fn commit_sizes(&self) -> Result<Vec<usize>, StoreError> {
        Ok(self.commits.lock().map_err(|_| StoreError::LockError)?.clone())
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.table.read().map_err(|_| StoreError::LockError)?;
        Ok(table.get(key).cloned())
    }

    fn iter_from(&self, start: &[u8]) -> Result<KeyValueIter<'_>, StoreError> {
        // Snapshot the tail so no lock is held while the caller iterates.
        let table = self.table.read().map_err(|_| StoreError::LockError)?;
        let entries: Vec<_> = table
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|(key, value)| Ok((key.clone(), value.clone())))
            .collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn begin_write(&self) -> Result<Box<dyn StorageWriteBatch>, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly("memory".to_string()));
        }
        Ok(Box::new(InMemoryWriteBatch {
            table: self.table.clone(),
            commits: self.commits.clone(),
            puts: Vec::new(),
        }))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

struct InMemoryWriteBatch {
    table: Arc<RwLock<Table>>,
    commits: Arc<Mutex<Vec<usize>>>,
    puts: Vec<(Vec<u8>, Vec<u8>)>,
}

impl StorageWriteBatch for InMemoryWriteBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.puts.push((key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn len(&self) -> usize {
        self.puts.len()
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self {
            table,
            commits,
            puts,
        } = *self;
        let size = puts.len();
        table
            .write()
            .map_err(|_| StoreError::LockError)?
            .extend(puts);
        commits
            .lock()
            .map_err(|_| StoreError::LockError)?
            .push(size);
        Ok(())
    }
}
