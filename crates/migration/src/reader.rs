//! Read-only access to a source store.
//!
//! The reader never writes: stores are opened without the writer lock so a
//! node that is still running on the same directory keeps working. Iteration
//! is strictly forward and single-threaded.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use ethereum_types::H256;
use ledger_storage::{
    EngineType, KeyValueIter, OpenMode, StorageBackend, open_backend, prefix_iter,
};
use serde::Serialize;
use tracing::debug;

use crate::{
    error::MigrationError,
    head::{ChainHeadPointer, HeadError, head_from_store},
    record::LedgerRecord,
    schema::{HASH_LENGTH, KeyCodec, LedgerRecordKind},
};

pub struct SourceReader {
    backend: Arc<dyn StorageBackend>,
    codec: KeyCodec,
    path: PathBuf,
}

impl SourceReader {
    /// Opens the store at `path` read-only. Failure here is fatal for the run.
    pub fn open(path: &Path, engine: EngineType, codec: KeyCodec) -> Result<Self, MigrationError> {
        let backend = open_backend(path, engine, OpenMode::ReadOnly).map_err(|source| {
            MigrationError::FatalOpen {
                role: "source",
                path: path.to_path_buf(),
                source,
            }
        })?;
        debug!(path = %path.display(), schema = %codec.version(), "Opened source store");
        Ok(Self {
            backend,
            codec,
            path: path.to_path_buf(),
        })
    }

    pub fn from_backend(backend: Arc<dyn StorageBackend>, codec: KeyCodec) -> Self {
        Self {
            backend,
            codec,
            path: PathBuf::from("memory"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> KeyCodec {
        self.codec
    }

    /// Full-keyspace iterator over decoded records.
    ///
    /// When the codec has a namespace, records from other namespaces are
    /// skipped. Unclassified keys are skipped and counted.
    pub fn records(&self) -> Result<SourceRecords<'_>, MigrationError> {
        let iter = self
            .backend
            .iter_from(&[])
            .map_err(MigrationError::SourceIteration)?;
        Ok(SourceRecords {
            iter,
            codec: self.codec,
            stats: SourceStats::default(),
        })
    }

    /// Returns the first record of `kind` whose key sorts at or after `from`.
    pub fn next_of_kind(
        &self,
        kind: LedgerRecordKind,
        from: &[u8],
    ) -> Result<Option<(Vec<u8>, LedgerRecord)>, MigrationError> {
        let Ok(prefix) = self.codec.kind_prefix(kind) else {
            return Ok(None);
        };
        let start = if from > prefix.as_slice() {
            from.to_vec()
        } else {
            prefix.clone()
        };
        let iter = self
            .backend
            .iter_from(&start)
            .map_err(MigrationError::SourceIteration)?
            .take_while(|entry| match entry {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            });
        for entry in iter {
            let (key, value) = entry.map_err(MigrationError::SourceIteration)?;
            let decoded = self.codec.decode(&key);
            if decoded.kind == kind {
                return Ok(Some((key, LedgerRecord::from_entry(decoded, value))));
            }
        }
        Ok(None)
    }

    /// Counts the records of `kind` in the store.
    pub fn count_of_kind(&self, kind: LedgerRecordKind) -> Result<u64, MigrationError> {
        let Ok(prefix) = self.codec.kind_prefix(kind) else {
            return Ok(0);
        };
        let mut count = 0;
        for entry in prefix_iter(self.backend.as_ref(), &prefix)
            .map_err(MigrationError::SourceIteration)?
        {
            let (key, _) = entry.map_err(MigrationError::SourceIteration)?;
            if self.codec.decode(&key).kind == kind {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn canonical_hash(&self, number: u64) -> Result<Option<H256>, MigrationError> {
        let Ok(key) = self
            .codec
            .encode(LedgerRecordKind::CanonicalHash, Some(number), None)
        else {
            return Ok(None);
        };
        let value = self
            .backend
            .get(&key)
            .map_err(MigrationError::SourceIteration)?;
        Ok(value
            .filter(|raw| raw.len() == HASH_LENGTH)
            .map(|raw| H256::from_slice(&raw)))
    }

    /// Head recorded by the source store's own head markers.
    pub fn head_pointer(&self) -> Result<ChainHeadPointer, HeadError> {
        head_from_store(self.backend.as_ref(), &self.codec)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub keys_scanned: u64,
    pub unclassified: u64,
    pub foreign_namespace: u64,
}

pub struct SourceRecords<'a> {
    iter: KeyValueIter<'a>,
    codec: KeyCodec,
    stats: SourceStats,
}

impl SourceRecords<'_> {
    pub fn stats(&self) -> SourceStats {
        self.stats
    }
}

impl Iterator for SourceRecords<'_> {
    type Item = Result<LedgerRecord, MigrationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.iter.next()? {
                Ok(entry) => entry,
                Err(error) => return Some(Err(MigrationError::SourceIteration(error))),
            };
            self.stats.keys_scanned += 1;

            let decoded = self.codec.decode(&key);
            if decoded.kind == LedgerRecordKind::Unclassified {
                self.stats.unclassified += 1;
                continue;
            }
            if let (Some(wanted), Some(found)) = (self.codec.namespace(), decoded.namespace)
                && wanted != found
            {
                self.stats.foreign_namespace += 1;
                continue;
            }
            return Some(Ok(LedgerRecord::from_entry(decoded, value)));
        }
    }
}
