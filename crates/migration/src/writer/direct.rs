//! Batched writes into a destination store.
//!
//! Records are re-encoded with the destination [`KeyCodec`] and staged in one
//! write batch that commits every `batch_size` records. A header fans out to
//! three keys: the header itself, the canonical hash for its number and the
//! number-by-hash index.

use std::{collections::HashMap, sync::Arc};

use ethereum_types::H256;
use ledger_storage::{StorageBackend, StorageWriteBatch};
use tracing::{debug, warn};

use super::{WriteOutcome, WriteStats};
use crate::{
    error::WriteError,
    head::ChainHeadPointer,
    record::LedgerRecord,
    schema::{EncodeError, HASH_LENGTH, KeyCodec, LedgerRecordKind},
    transport::TransportEntry,
};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// Records per commit.
    pub batch_size: usize,
    pub skip_existing: bool,
    pub dry_run: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            skip_existing: true,
            dry_run: false,
        }
    }
}

pub struct DirectWriter {
    backend: Arc<dyn StorageBackend>,
    codec: KeyCodec,
    options: WriterOptions,
    batch: Option<Box<dyn StorageWriteBatch>>,
    pending_records: u64,
    /// Canonical hashes staged in the open batch, by number.
    pending_canonical: HashMap<u64, H256>,
    pending_highest: Option<ChainHeadPointer>,
    highest: Option<ChainHeadPointer>,
    stats: WriteStats,
}

impl DirectWriter {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: KeyCodec, options: WriterOptions) -> Self {
        Self {
            backend,
            codec,
            options: WriterOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            batch: None,
            pending_records: 0,
            pending_canonical: HashMap::new(),
            pending_highest: None,
            highest: None,
            stats: WriteStats::default(),
        }
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    pub fn codec(&self) -> KeyCodec {
        self.codec
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Highest header present in the destination: committed by this writer
    /// or found already there.
    pub fn highest_block(&self) -> Option<ChainHeadPointer> {
        self.highest
    }

    pub fn write_entry(&mut self, entry: &TransportEntry) -> Result<WriteOutcome, WriteError> {
        match entry {
            TransportEntry::Record(record) => self.write(record),
            TransportEntry::RpcBlock(block) => {
                self.stats.errors += 1;
                Err(WriteError::Unsupported(format!("RPC block #{}", block.number)))
            }
        }
    }

    /// Writes one record. Failures are counted before being returned.
    pub fn write(&mut self, record: &LedgerRecord) -> Result<WriteOutcome, WriteError> {
        match self.try_write(record) {
            Ok(outcome) => Ok(outcome),
            // Commit failures were already counted for the whole batch.
            Err(error @ WriteError::Commit { .. }) => Err(error),
            Err(error) => {
                self.stats.errors += 1;
                warn!(
                    record = %record,
                    %error,
                    "Failed to write record"
                );
                Err(error)
            }
        }
    }

    fn try_write(&mut self, record: &LedgerRecord) -> Result<WriteOutcome, WriteError> {
        let puts = self.destination_puts(record)?;
        let header = self.header_pointer(record);

        if self.options.skip_existing && self.exists(record, &puts)? {
            self.stats.skipped += 1;
            note_highest(&mut self.highest, header);
            return Ok(WriteOutcome::Skipped);
        }

        if self.options.dry_run {
            self.stats.written += 1;
            note_highest(&mut self.highest, header);
            return Ok(WriteOutcome::DryRun);
        }

        let mut batch = match self.batch.take() {
            Some(batch) => batch,
            None => self.backend.begin_write()?,
        };
        let staged = puts
            .iter()
            .try_for_each(|(key, value)| batch.put(key, value));
        self.batch = Some(batch);
        staged?;
        self.pending_records += 1;
        if let Some(head) = header {
            self.pending_canonical
                .insert(head.last_block_number, head.last_block_hash);
        }
        if record.kind == LedgerRecordKind::CanonicalHash
            && let (Some(number), Some(hash)) = (record.block_number, record.block_hash)
        {
            self.pending_canonical.insert(number, hash);
        }
        note_highest(&mut self.pending_highest, header);

        if self.pending_records >= self.options.batch_size as u64 {
            self.commit()?;
        }
        Ok(WriteOutcome::Written)
    }

    /// Commits the open batch, if any.
    pub fn flush(&mut self) -> Result<(), WriteError> {
        self.commit()
    }

    fn commit(&mut self) -> Result<(), WriteError> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        let records = std::mem::take(&mut self.pending_records);
        let pending_highest = self.pending_highest.take();
        self.pending_canonical.clear();

        match batch.commit() {
            Ok(()) => {
                self.stats.written += records;
                self.stats.commits += 1;
                note_highest(&mut self.highest, pending_highest);
                debug!(records, commits = self.stats.commits, "Committed batch");
                Ok(())
            }
            Err(source) => {
                self.stats.errors += records;
                warn!(records, %source, "Batch commit failed, counting its records as errors");
                Err(WriteError::Commit {
                    records: records as usize,
                    source,
                })
            }
        }
    }

    fn header_pointer(&self, record: &LedgerRecord) -> Option<ChainHeadPointer> {
        if record.kind != LedgerRecordKind::Header {
            return None;
        }
        Some(ChainHeadPointer {
            last_block_number: record.block_number?,
            last_block_hash: record.header_hash()?,
        })
    }

    /// Key/value pairs this record turns into in the destination schema.
    fn destination_puts(&self, record: &LedgerRecord) -> Result<Vec<(Vec<u8>, Vec<u8>)>, WriteError> {
        if record.kind == LedgerRecordKind::Unclassified {
            return Err(WriteError::Unsupported(record.kind.to_string()));
        }

        if record.kind == LedgerRecordKind::Header {
            let number = record
                .block_number
                .ok_or(EncodeError::MissingNumber { kind: record.kind })?;
            let hash = record
                .header_hash()
                .ok_or(EncodeError::MissingHash { kind: record.kind })?;
            return Ok(vec![
                (
                    self.codec.encode(record.kind, Some(number), Some(hash))?,
                    record.payload.clone(),
                ),
                (
                    self.codec
                        .encode(LedgerRecordKind::CanonicalHash, Some(number), None)?,
                    hash.as_bytes().to_vec(),
                ),
                (
                    self.codec
                        .encode(LedgerRecordKind::HeaderHashIndex, None, Some(hash))?,
                    number.to_be_bytes().to_vec(),
                ),
            ]);
        }

        let hash = match (record.block_hash, record.block_number) {
            (Some(hash), _) => Some(hash),
            // Sources that key bodies by number only: borrow the canonical
            // hash the destination already knows.
            (None, Some(number)) if record.kind.is_number_keyed() => {
                self.canonical_hash(number)?
            }
            (None, _) => None,
        };
        let key = self.codec.encode(record.kind, record.block_number, hash)?;
        Ok(vec![(key, record.payload.clone())])
    }

    fn canonical_hash(&self, number: u64) -> Result<Option<H256>, WriteError> {
        if let Some(hash) = self.pending_canonical.get(&number) {
            return Ok(Some(*hash));
        }
        let key = self
            .codec
            .encode(LedgerRecordKind::CanonicalHash, Some(number), None)?;
        Ok(self
            .backend
            .get(&key)?
            .filter(|raw| raw.len() == HASH_LENGTH)
            .map(|raw| H256::from_slice(&raw)))
    }

    /// Presence check against committed destination data.
    ///
    /// A header counts as present only when its key exists and the canonical
    /// mapping for its number already names it.
    fn exists(&self, record: &LedgerRecord, puts: &[(Vec<u8>, Vec<u8>)]) -> Result<bool, WriteError> {
        let Some((key, _)) = puts.first() else {
            return Ok(false);
        };
        if !self.backend.contains(key)? {
            return Ok(false);
        }
        if record.kind != LedgerRecordKind::Header {
            return Ok(true);
        }
        let Some(number) = record.block_number else {
            return Ok(false);
        };
        let canonical_key = self
            .codec
            .encode(LedgerRecordKind::CanonicalHash, Some(number), None)?;
        Ok(self.backend.get(&canonical_key)?.as_deref() == record.header_hash().as_ref().map(H256::as_bytes))
    }
}

fn note_highest(slot: &mut Option<ChainHeadPointer>, candidate: Option<ChainHeadPointer>) {
    if let Some(candidate) = candidate
        && slot.is_none_or(|current| candidate.last_block_number > current.last_block_number)
    {
        *slot = Some(candidate);
    }
}
