//! Bulk migration of ledger data between stores, transport files and live
//! nodes.
//!
//! A run is described by a [`MigrationJob`] and executed by an
//! [`Orchestrator`]: records are read from the source, re-keyed for the
//! destination schema, written in batches, and finished off with head
//! reconciliation and a sampled verification.

pub mod copy;
pub mod error;
pub mod head;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod reader;
pub mod record;
pub mod rpc;
pub mod schema;
pub mod transport;
pub mod verify;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use copy::{BLOCKCHAIN_PREFIXES, CopyStats, PrefixCopy, STATE_PREFIXES, copy_prefixes};
pub use error::{MigrationError, RecordDecodeError, WriteError};
pub use head::{ChainHeadPointer, HeadError, HeadReconciler, HeadStrategy, parse_manual_head};
pub use job::{BlockRange, DestinationDescriptor, MigrationJob, SourceDescriptor, StoreLocation};
pub use orchestrator::{MigrationSummary, Orchestrator, RunStatus};
pub use record::LedgerRecord;
pub use schema::{KeyCodec, LedgerRecordKind, SchemaVersion};
pub use transport::{Compression, ExportMetadata, TransportEntry, TransportReader};
pub use verify::{VerificationReport, Verifier};
