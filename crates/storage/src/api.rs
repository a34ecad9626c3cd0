//! Backend-agnostic key-value interface.
//!
//! Stores are flat ordered keyspaces: keys sort bytewise and iteration always
//! moves forward. Writes go through a [`StorageWriteBatch`], which becomes
//! visible atomically on [`StorageWriteBatch::commit`].

use std::fmt::Debug;

use crate::error::StoreError;

/// A raw `(key, value)` pair as stored on disk.
pub type KeyValuePair = (Vec<u8>, Vec<u8>);

/// Forward iterator over raw store entries.
pub type KeyValueIter<'a> = Box<dyn Iterator<Item = Result<KeyValuePair, StoreError>> + 'a>;

pub trait StorageBackend: Debug + Send + Sync {
    /// Reads a value for the given key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Checks if a key exists in the store.
    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterates the keyspace in ascending order starting at `start` (inclusive).
    fn iter_from(&self, start: &[u8]) -> Result<KeyValueIter<'_>, StoreError>;

    /// Starts a new write batch. Fails on read-only handles.
    fn begin_write(&self) -> Result<Box<dyn StorageWriteBatch>, StoreError>;

    fn is_read_only(&self) -> bool;
}

/// A set of puts applied as a single atomic commit.
pub trait StorageWriteBatch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Number of puts staged so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Returns an iterator limited to keys starting with `prefix`.
pub fn prefix_iter<'a>(
    backend: &'a dyn StorageBackend,
    prefix: &'a [u8],
) -> Result<KeyValueIter<'a>, StoreError> {
    let iter = backend.iter_from(prefix)?.take_while(move |entry| match entry {
        Ok((key, _)) => key.starts_with(prefix),
        Err(_) => true,
    });
    Ok(Box::new(iter))
}
