use std::path::PathBuf;

use ethereum_types::H256;
use ledger_storage::StoreError;
use thiserror::Error;

use crate::{
    head::HeadError,
    rpc::RpcError,
    schema::{EncodeError, LedgerRecordKind},
};

/// Errors that abort a migration run.
///
/// Everything scoped to a single record is a [`RecordDecodeError`] or a
/// [`WriteError`] instead, and ends up in the run's counters.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Cannot open {role} store at {path}: {source}")]
    FatalOpen {
        role: &'static str,
        path: PathBuf,
        #[source]
        source: StoreError,
    },
    #[error("Transport stream I/O failed on {path}: {source}")]
    TransportIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Source iteration failed: {0}")]
    SourceIteration(#[source] StoreError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Head reconciliation failed: {0}")]
    Head(#[from] HeadError),
    #[error("Invalid migration job: {0}")]
    InvalidJob(String),
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

/// A single line or key that could not be turned into a usable record.
#[derive(Debug, Error)]
pub enum RecordDecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("line has no `type` field")]
    MissingType,
    #[error("{kind} record has no block number")]
    MissingBlockNumber { kind: LedgerRecordKind },
    #[error("{kind} record must not carry a block number")]
    UnexpectedBlockNumber { kind: LedgerRecordKind },
    #[error("{kind} record has no hash")]
    MissingHash { kind: LedgerRecordKind },
    #[error("unclassified records cannot be transported")]
    Unclassified,
    #[error("RPC block has an invalid `{field}` field")]
    InvalidRpcBlock { field: &'static str },
}

/// Failure to write or submit one record.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("cannot encode destination key: {0}")]
    Encode(#[from] EncodeError),
    #[error("destination store error: {0}")]
    Store(#[from] StoreError),
    #[error("commit of {records} record(s) failed: {source}")]
    Commit {
        records: usize,
        #[source]
        source: StoreError,
    },
    #[error("{0} cannot be written to this destination")]
    Unsupported(String),
    #[error("submission of block {number:?} ({hash:?}) failed: {source}")]
    Submit {
        number: Option<u64>,
        hash: Option<H256>,
        #[source]
        source: RpcError,
    },
    #[error("transport write failed: {0}")]
    TransportIo(#[from] std::io::Error),
}

impl WriteError {
    /// Stream-level failures end the run, everything else is counted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriteError::TransportIo(_))
    }
}
