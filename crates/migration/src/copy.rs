//! Verbatim copy of raw key ranges between two stores.
//!
//! Keys are not decoded: everything starting with one of the requested
//! prefixes is copied as-is, which is what an operator wants when both stores
//! share a layout and only the engine differs.

use ledger_storage::{StorageBackend, StorageWriteBatch, prefix_iter};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::MigrationError;

pub const DEFAULT_COPY_BATCH_SIZE: usize = 10_000;

/// Chain data tags: bodies, receipts, headers, number index, tx lookups.
pub const BLOCKCHAIN_PREFIXES: &[u8] = b"brhHl";
/// State tags: accounts, storage, code.
pub const STATE_PREFIXES: &[u8] = b"asc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixCopy {
    pub prefixes: Vec<Vec<u8>>,
    pub batch_size: usize,
    pub skip_existing: bool,
    pub dry_run: bool,
}

impl PrefixCopy {
    pub fn new(prefixes: Vec<Vec<u8>>) -> Self {
        Self {
            prefixes,
            batch_size: DEFAULT_COPY_BATCH_SIZE,
            skip_existing: false,
            dry_run: false,
        }
    }

    /// One single-byte prefix per tag.
    pub fn from_tags(tags: &[u8]) -> Self {
        Self::new(tags.iter().map(|tag| vec![*tag]).collect())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CopyStats {
    pub scanned: u64,
    pub copied: u64,
    pub skipped: u64,
    pub errors: u64,
    pub commits: u64,
    pub cancelled: bool,
}

/// Copies every entry under the configured prefixes from `source` to
/// `destination`, committing every `batch_size` entries.
///
/// Source read failures abort the copy. A failed commit counts its entries
/// as errors and the copy goes on.
pub fn copy_prefixes(
    source: &dyn StorageBackend,
    destination: &dyn StorageBackend,
    options: &PrefixCopy,
    cancel: &CancellationToken,
) -> Result<CopyStats, MigrationError> {
    let batch_size = options.batch_size.max(1);
    let mut stats = CopyStats::default();
    let mut batch: Option<Box<dyn StorageWriteBatch>> = None;

    'prefixes: for prefix in &options.prefixes {
        for entry in prefix_iter(source, prefix).map_err(MigrationError::SourceIteration)? {
            let (key, value) = entry.map_err(MigrationError::SourceIteration)?;
            stats.scanned += 1;

            if options.skip_existing {
                match destination.contains(&key) {
                    Ok(true) => {
                        stats.skipped += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(error) => {
                        warn!(%error, "Existence check failed");
                        stats.errors += 1;
                        continue;
                    }
                }
            }
            if options.dry_run {
                stats.copied += 1;
                continue;
            }

            let staged = match batch.as_mut() {
                Some(open) => open.put(&key, &value),
                None => destination.begin_write().and_then(|mut open| {
                    let result = open.put(&key, &value);
                    batch = Some(open);
                    result
                }),
            };
            if let Err(error) = staged {
                warn!(%error, "Failed to stage entry");
                stats.errors += 1;
                continue;
            }

            if batch.as_ref().is_some_and(|open| open.len() >= batch_size) {
                commit(&mut batch, &mut stats);
                if cancel.is_cancelled() {
                    stats.cancelled = true;
                    break 'prefixes;
                }
            }
        }
        info!(
            prefix = %hex::encode(prefix),
            copied = stats.copied,
            skipped = stats.skipped,
            "Finished prefix"
        );
    }

    commit(&mut batch, &mut stats);
    Ok(stats)
}

fn commit(batch: &mut Option<Box<dyn StorageWriteBatch>>, stats: &mut CopyStats) {
    let Some(open) = batch.take() else {
        return;
    };
    let entries = open.len() as u64;
    match open.commit() {
        Ok(()) => {
            stats.copied += entries;
            stats.commits += 1;
            info!(copied = stats.copied, "Committed copy batch");
        }
        Err(error) => {
            warn!(entries, %error, "Copy batch commit failed");
            stats.errors += entries;
        }
    }
}
