//! Chain head reconciliation.
//!
//! After a bulk import the destination has blocks but its head pointers still
//! point at genesis (or nowhere). The reconciler writes the three head markers
//! and the resume metadata the execution engine reads on boot:
//!
//! | File                          | Content                 |
//! |-------------------------------|-------------------------|
//! | `<dir>/vm/lastAccepted`       | head hash (32 bytes)    |
//! | `<dir>/vm/lastAcceptedHeight` | head number (8 BE)      |
//! | `<dir>/vm/initialized`        | `0x01`                  |

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use ethereum_types::H256;
use ledger_storage::{StorageBackend, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    rpc::{ChainRpc, RpcError, parse_h256},
    schema::{HASH_LENGTH, HeadMarker, KeyCodec, LedgerRecordKind, NUMBER_LENGTH},
};

pub const RESUME_METADATA_DIR: &str = "vm";
pub const LAST_ACCEPTED_FILE: &str = "lastAccepted";
pub const LAST_ACCEPTED_HEIGHT_FILE: &str = "lastAcceptedHeight";
pub const INITIALIZED_FILE: &str = "initialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainHeadPointer {
    pub last_block_number: u64,
    pub last_block_hash: H256,
}

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("Head marker {0} not found")]
    MissingMarker(&'static str),
    #[error("Head marker {marker} has unexpected length {len} (expected 32)")]
    MalformedMarker { marker: &'static str, len: usize },
    #[error("Block number not found for hash {0:#x}")]
    UnknownHash(H256),
    #[error("Invalid block hash `{0}`: expected 32 bytes of hex")]
    InvalidHash(String),
    #[error("Resume metadata file {0} is malformed")]
    MalformedResumeMetadata(&'static str),
    #[error("Node has no block at height {0}")]
    MissingBlock(u64),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Cannot write resume metadata in {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the head written by the reconciler is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HeadStrategy {
    /// Highest header present in the destination after the write pass.
    #[default]
    Written,
    Manual(ChainHeadPointer),
    /// The source store's own head markers.
    FromSource,
    /// Current head of a live node.
    FromRpc(String),
    Skip,
}

/// Parses an operator-supplied head, accepting the hash with or without `0x`.
pub fn parse_manual_head(height: u64, hash: &str) -> Result<ChainHeadPointer, HeadError> {
    let digits = hash.strip_prefix("0x").unwrap_or(hash);
    let bytes = hex::decode(digits).map_err(|_| HeadError::InvalidHash(hash.to_string()))?;
    if bytes.len() != HASH_LENGTH {
        return Err(HeadError::InvalidHash(hash.to_string()));
    }
    Ok(ChainHeadPointer {
        last_block_number: height,
        last_block_hash: H256::from_slice(&bytes),
    })
}

/// Reads a store's head from `LastHeader` (falling back to `LastBlock`) and
/// resolves its number through the hash index.
pub fn head_from_store(
    backend: &dyn StorageBackend,
    codec: &KeyCodec,
) -> Result<ChainHeadPointer, HeadError> {
    let hash = read_marker(backend, codec, HeadMarker::LastHeader)?
        .or(read_marker(backend, codec, HeadMarker::LastBlock)?)
        .ok_or(HeadError::MissingMarker("LastHeader"))?;

    let index_key = codec
        .encode(LedgerRecordKind::HeaderHashIndex, None, Some(hash))
        .map_err(|_| HeadError::UnknownHash(hash))?;
    let raw = backend.get(&index_key)?.ok_or(HeadError::UnknownHash(hash))?;
    let raw: [u8; NUMBER_LENGTH] = raw
        .as_slice()
        .try_into()
        .map_err(|_| HeadError::UnknownHash(hash))?;

    Ok(ChainHeadPointer {
        last_block_number: u64::from_be_bytes(raw),
        last_block_hash: hash,
    })
}

/// Asks a live node for its current height and the hash of that block.
pub async fn head_from_rpc(client: &dyn ChainRpc) -> Result<ChainHeadPointer, HeadError> {
    let height = client.block_number().await?;
    let block = client.require_block(height, false).await?;
    let hash = block
        .get("hash")
        .ok_or(HeadError::MissingBlock(height))
        .and_then(|value| parse_h256(value, "eth_getBlockByNumber").map_err(HeadError::from))?;
    Ok(ChainHeadPointer {
        last_block_number: height,
        last_block_hash: hash,
    })
}

fn read_marker(
    backend: &dyn StorageBackend,
    codec: &KeyCodec,
    marker: HeadMarker,
) -> Result<Option<H256>, HeadError> {
    let Some(raw) = backend.get(&codec.head_marker_key(marker))? else {
        return Ok(None);
    };
    if raw.len() != HASH_LENGTH {
        return Err(HeadError::MalformedMarker {
            marker: marker_name(marker),
            len: raw.len(),
        });
    }
    Ok(Some(H256::from_slice(&raw)))
}

fn marker_name(marker: HeadMarker) -> &'static str {
    match marker {
        HeadMarker::LastBlock => "LastBlock",
        HeadMarker::LastHeader => "LastHeader",
        HeadMarker::LastFast => "LastFast",
    }
}

/// Current values of the three head markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeadMarkers {
    pub last_block: Option<H256>,
    pub last_header: Option<H256>,
    pub last_fast: Option<H256>,
}

impl HeadMarkers {
    /// All three present and equal.
    pub fn is_consistent(&self) -> bool {
        self.last_block.is_some()
            && self.last_block == self.last_header
            && self.last_block == self.last_fast
    }
}

pub struct HeadReconciler {
    backend: Arc<dyn StorageBackend>,
    codec: KeyCodec,
    resume_dir: Option<PathBuf>,
}

impl HeadReconciler {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: KeyCodec, resume_dir: Option<PathBuf>) -> Self {
        Self {
            backend,
            codec,
            resume_dir,
        }
    }

    /// Points the destination at `head`: the three markers in one commit,
    /// then the resume metadata files.
    pub fn reconcile(&self, head: ChainHeadPointer) -> Result<(), HeadError> {
        let mut batch = self.backend.begin_write()?;
        for marker in HeadMarker::ALL {
            batch.put(
                &self.codec.head_marker_key(marker),
                head.last_block_hash.as_bytes(),
            )?;
        }
        batch.commit()?;
        info!(
            number = head.last_block_number,
            hash = %format!("{:#x}", head.last_block_hash),
            "Updated head markers"
        );

        match &self.resume_dir {
            Some(dir) => write_resume_metadata(dir, head)?,
            None => warn!("No resume directory configured, skipping resume metadata"),
        }
        Ok(())
    }

    pub fn read_markers(&self) -> Result<HeadMarkers, HeadError> {
        read_markers(self.backend.as_ref(), &self.codec)
    }
}

pub fn read_markers(backend: &dyn StorageBackend, codec: &KeyCodec) -> Result<HeadMarkers, HeadError> {
    Ok(HeadMarkers {
        last_block: read_marker(backend, codec, HeadMarker::LastBlock)?,
        last_header: read_marker(backend, codec, HeadMarker::LastHeader)?,
        last_fast: read_marker(backend, codec, HeadMarker::LastFast)?,
    })
}

pub fn write_resume_metadata(dir: &Path, head: ChainHeadPointer) -> Result<(), HeadError> {
    let vm_dir = dir.join(RESUME_METADATA_DIR);
    let io_err = |source: std::io::Error| HeadError::Io {
        path: vm_dir.clone(),
        source,
    };
    fs::create_dir_all(&vm_dir).map_err(io_err)?;
    fs::write(
        vm_dir.join(LAST_ACCEPTED_FILE),
        head.last_block_hash.as_bytes(),
    )
    .map_err(io_err)?;
    fs::write(
        vm_dir.join(LAST_ACCEPTED_HEIGHT_FILE),
        head.last_block_number.to_be_bytes(),
    )
    .map_err(io_err)?;
    fs::write(vm_dir.join(INITIALIZED_FILE), [1u8]).map_err(io_err)?;
    info!(dir = %vm_dir.display(), "Wrote resume metadata");
    Ok(())
}

/// Reads back the resume metadata, `None` when it was never written.
pub fn read_resume_metadata(dir: &Path) -> Result<Option<ChainHeadPointer>, HeadError> {
    let vm_dir = dir.join(RESUME_METADATA_DIR);
    let io_err = |source: std::io::Error| HeadError::Io {
        path: vm_dir.clone(),
        source,
    };
    if !vm_dir.join(INITIALIZED_FILE).exists() {
        return Ok(None);
    }
    let hash = fs::read(vm_dir.join(LAST_ACCEPTED_FILE)).map_err(io_err)?;
    let height = fs::read(vm_dir.join(LAST_ACCEPTED_HEIGHT_FILE)).map_err(io_err)?;
    let height: [u8; NUMBER_LENGTH] = height
        .as_slice()
        .try_into()
        .map_err(|_| HeadError::MalformedResumeMetadata(LAST_ACCEPTED_HEIGHT_FILE))?;
    if hash.len() != HASH_LENGTH {
        return Err(HeadError::MalformedResumeMetadata(LAST_ACCEPTED_FILE));
    }
    Ok(Some(ChainHeadPointer {
        last_block_number: u64::from_be_bytes(height),
        last_block_hash: H256::from_slice(&hash),
    }))
}
