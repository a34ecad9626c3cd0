//! Destination writers.
//!
//! [`DirectWriter`] re-encodes records into a destination store in batches,
//! [`TransportSink`] appends them to a transport file and [`RpcSubmitter`]
//! pushes them to a live node through a worker pool.

pub mod direct;
pub mod rpc;

use serde::Serialize;

pub use direct::{DirectWriter, WriterOptions};
pub use rpc::{ImportMethod, RpcSubmitter, SubmitHandle, SubmitOptions};

use crate::{
    error::{MigrationError, WriteError},
    transport::{ExportMetadata, TransportEntry, TransportWriter},
};

/// What happened to one accepted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Written, or staged in a batch that has not been committed yet.
    Written,
    /// Already present in the destination.
    Skipped,
    /// Counted as a would-be write without touching the destination.
    DryRun,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub written: u64,
    pub skipped: u64,
    pub errors: u64,
    pub commits: u64,
}

/// Transport file as a destination.
///
/// In dry-run mode no file is created and entries are only counted.
pub struct TransportSink {
    writer: Option<TransportWriter>,
    stats: WriteStats,
}

impl TransportSink {
    pub fn new(mut writer: TransportWriter, metadata: &ExportMetadata) -> Result<Self, MigrationError> {
        writer
            .write_metadata(metadata)
            .map_err(|source| MigrationError::TransportIo {
                path: writer.path().to_path_buf(),
                source,
            })?;
        Ok(Self {
            writer: Some(writer),
            stats: WriteStats::default(),
        })
    }

    pub fn dry_run() -> Self {
        Self {
            writer: None,
            stats: WriteStats::default(),
        }
    }

    pub fn write(&mut self, entry: &TransportEntry) -> Result<WriteOutcome, WriteError> {
        let Some(writer) = self.writer.as_mut() else {
            self.stats.written += 1;
            return Ok(WriteOutcome::DryRun);
        };
        writer.write_entry(entry)?;
        self.stats.written += 1;
        Ok(WriteOutcome::Written)
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Finalizes the file. Returns the number of lines written, metadata
    /// included.
    pub fn finish(self) -> Result<u64, MigrationError> {
        match self.writer {
            Some(writer) => writer.finish(),
            None => Ok(0),
        }
    }
}
