//! Description of one migration run.
//!
//! A [`MigrationJob`] is built once per invocation and handed to the
//! orchestrator by value. Nothing in it is global or persisted.

use std::{fmt, num::NonZeroUsize, path::PathBuf, time::Duration};

use ethereum_types::H256;
use ledger_storage::EngineType;

use crate::{
    error::MigrationError,
    head::HeadStrategy,
    rpc::RpcConfig,
    schema::{KeyCodec, SchemaVersion},
    transport::Compression,
    writer::{ImportMethod, direct::DEFAULT_BATCH_SIZE},
};

/// One worker per available core. The fetch and submit pools apply their
/// own caps on top.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// A store on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    pub path: PathBuf,
    pub engine: EngineType,
    pub schema: SchemaVersion,
    pub namespace: Option<H256>,
}

impl StoreLocation {
    pub fn codec(&self) -> KeyCodec {
        KeyCodec::new(self.schema).with_namespace(self.namespace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    Store(StoreLocation),
    Transport { path: PathBuf },
    Rpc { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationDescriptor {
    Store(StoreLocation),
    Transport {
        path: PathBuf,
        compression: Compression,
    },
    Rpc {
        url: String,
        method: ImportMethod,
    },
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Store(store) => {
                write!(f, "store:{}:{}", store.schema, store.path.display())
            }
            SourceDescriptor::Transport { path } => write!(f, "file:{}", path.display()),
            SourceDescriptor::Rpc { url } => write!(f, "rpc:{url}"),
        }
    }
}

impl fmt::Display for DestinationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationDescriptor::Store(store) => {
                write!(f, "store:{}:{}", store.schema, store.path.display())
            }
            DestinationDescriptor::Transport { path, .. } => write!(f, "file:{}", path.display()),
            DestinationDescriptor::Rpc { url, .. } => write!(f, "rpc:{url}"),
        }
    }
}

/// Inclusive block range. An open end means "up to the source head".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl BlockRange {
    pub fn contains(&self, number: u64) -> bool {
        number >= self.start && self.end.is_none_or(|end| number <= end)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationJob {
    pub source: SourceDescriptor,
    pub destination: DestinationDescriptor,
    pub block_range: BlockRange,
    /// Records per destination commit.
    pub batch_size: usize,
    pub worker_count: usize,
    pub dry_run: bool,
    pub skip_existing: bool,
    /// Copy trie nodes along with block data.
    pub include_state: bool,
    /// Cancel the run once this much time has passed.
    pub deadline: Option<Duration>,
    pub head: HeadStrategy,
    /// Directory receiving the `vm/` resume metadata.
    pub resume_dir: Option<PathBuf>,
    pub verify: bool,
    pub rpc: RpcConfig,
}

impl MigrationJob {
    pub fn new(source: SourceDescriptor, destination: DestinationDescriptor) -> Self {
        Self {
            source,
            destination,
            block_range: BlockRange::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            worker_count: default_worker_count(),
            dry_run: false,
            skip_existing: true,
            include_state: true,
            deadline: None,
            head: HeadStrategy::default(),
            resume_dir: None,
            verify: true,
            rpc: RpcConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.batch_size == 0 {
            return Err(MigrationError::InvalidJob("batch size must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(MigrationError::InvalidJob("worker count must be at least 1".into()));
        }
        if let Some(end) = self.block_range.end
            && end < self.block_range.start
        {
            return Err(MigrationError::InvalidJob(format!(
                "block range end {end} is below start {}",
                self.block_range.start
            )));
        }
        for location in [self.source_store(), self.destination_store()]
            .into_iter()
            .flatten()
        {
            if location.schema.is_namespaced() && location.namespace.is_none() {
                return Err(MigrationError::InvalidJob(format!(
                    "schema {} needs a chain namespace for {}",
                    location.schema,
                    location.path.display()
                )));
            }
        }
        match (&self.source, &self.destination) {
            (SourceDescriptor::Rpc { .. }, DestinationDescriptor::Store(_)) => {
                Err(MigrationError::InvalidJob(
                    "RPC sources carry no raw store records; export to a file or migrate to an RPC destination".into(),
                ))
            }
            (SourceDescriptor::Store(from), DestinationDescriptor::Store(to)) if from.path == to.path => {
                Err(MigrationError::InvalidJob("source and destination are the same store".into()))
            }
            (_, DestinationDescriptor::Rpc { .. } | DestinationDescriptor::Transport { .. })
                if matches!(self.head, HeadStrategy::Manual(_) | HeadStrategy::FromSource | HeadStrategy::FromRpc(_)) => {
                Err(MigrationError::InvalidJob(
                    "head reconciliation needs a store destination".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn source_store(&self) -> Option<&StoreLocation> {
        match &self.source {
            SourceDescriptor::Store(location) => Some(location),
            _ => None,
        }
    }

    pub fn destination_store(&self) -> Option<&StoreLocation> {
        match &self.destination {
            DestinationDescriptor::Store(location) => Some(location),
            _ => None,
        }
    }
}
