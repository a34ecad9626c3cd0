//! Fixtures shared by the unit tests.

use std::{collections::BTreeMap, ops::RangeInclusive, sync::Mutex, time::Duration};

use async_trait::async_trait;
use ethereum_types::H256;
use ledger_storage::{InMemoryBackend, StorageBackend};
use serde_json::{Value, json};

use crate::{
    record::keccak256,
    rpc::{ChainRpc, RpcError, parse_u64},
    schema::{HeadMarker, KeyCodec, LedgerRecordKind},
};

/// Records written per block by [`populate_chain`].
pub const RECORDS_PER_BLOCK: u64 = 6;

pub fn header_payload(number: u64) -> Vec<u8> {
    format!("header-{number}").into_bytes()
}

/// Writes blocks `0..blocks` in `codec`'s layout and points the head markers
/// at the last one. Returns the block hashes.
pub fn populate_chain(backend: &InMemoryBackend, codec: &KeyCodec, blocks: u64) -> Vec<H256> {
    let mut batch = backend.begin_write().unwrap();
    let mut hashes = Vec::new();
    for number in 0..blocks {
        let header = header_payload(number);
        let hash = keccak256(&header);
        let put = |batch: &mut Box<dyn ledger_storage::StorageWriteBatch>,
                   kind: LedgerRecordKind,
                   n: Option<u64>,
                   h: Option<H256>,
                   value: &[u8]| {
            let key = codec.encode(kind, n, h).unwrap();
            batch.put(&key, value).unwrap();
        };
        put(&mut batch, LedgerRecordKind::Header, Some(number), Some(hash), &header);
        put(
            &mut batch,
            LedgerRecordKind::CanonicalHash,
            Some(number),
            None,
            hash.as_bytes(),
        );
        put(
            &mut batch,
            LedgerRecordKind::HeaderHashIndex,
            None,
            Some(hash),
            &number.to_be_bytes(),
        );
        put(
            &mut batch,
            LedgerRecordKind::Body,
            Some(number),
            Some(hash),
            format!("body-{number}").as_bytes(),
        );
        put(
            &mut batch,
            LedgerRecordKind::Receipts,
            Some(number),
            Some(hash),
            format!("receipts-{number}").as_bytes(),
        );
        let node = format!("account-node-{number}").into_bytes();
        put(
            &mut batch,
            LedgerRecordKind::AccountTrieNode,
            None,
            Some(keccak256(&node)),
            &node,
        );
        hashes.push(hash);
    }
    if let Some(last) = hashes.last() {
        for marker in HeadMarker::ALL {
            batch
                .put(&codec.head_marker_key(marker), last.as_bytes())
                .unwrap();
        }
    }
    batch.commit().unwrap();
    hashes
}

/// In-process node answering the handful of methods the migration uses.
#[derive(Debug, Default)]
pub struct MockChain {
    blocks: Mutex<BTreeMap<u64, Value>>,
    imported: Mutex<Vec<Value>>,
    raw_transactions: Mutex<Vec<String>>,
    /// Methods answered with a JSON-RPC error.
    rejected: Mutex<Vec<String>>,
    import_delay: Option<Duration>,
}

impl MockChain {
    pub fn with_blocks(range: RangeInclusive<u64>) -> Self {
        let chain = Self::default();
        {
            let mut blocks = chain.blocks.lock().unwrap();
            for number in range {
                blocks.insert(number, Self::mock_block(number));
            }
        }
        chain
    }

    pub fn block_hash(number: u64) -> H256 {
        H256::from_low_u64_be(number + 1)
    }

    pub fn mock_block(number: u64) -> Value {
        json!({
            "number": format!("0x{number:x}"),
            "hash": format!("{:#x}", Self::block_hash(number)),
            "parentHash": format!("{:#x}", number.checked_sub(1).map(Self::block_hash).unwrap_or_default()),
            "transactions": [
                {"hash": format!("{:#x}", H256::from_low_u64_be(number * 1000)), "raw": format!("0x{:04x}", number)}
            ],
        })
    }

    /// Every bulk import call takes at least `delay`.
    pub fn with_import_delay(mut self, delay: Duration) -> Self {
        self.import_delay = Some(delay);
        self
    }

    pub fn reject(&self, method: &str) {
        self.rejected.lock().unwrap().push(method.to_string());
    }

    pub fn imported(&self) -> Vec<Value> {
        self.imported.lock().unwrap().clone()
    }

    pub fn raw_transactions(&self) -> Vec<String> {
        self.raw_transactions.lock().unwrap().clone()
    }

    pub fn height(&self) -> Option<u64> {
        self.blocks.lock().unwrap().keys().next_back().copied()
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.rejected.lock().unwrap().iter().any(|m| m == method) {
            return Err(RpcError::Rejected {
                method: method.to_string(),
                code: -32000,
                message: "rejected".to_string(),
            });
        }
        match method {
            "eth_blockNumber" => Ok(json!(format!("0x{:x}", self.height().unwrap_or_default()))),
            "eth_getBlockByNumber" => {
                let number = parse_u64(&params[0], method)?;
                Ok(self
                    .blocks
                    .lock()
                    .unwrap()
                    .get(&number)
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "migrate_importBlocks" => {
                if let Some(delay) = self.import_delay {
                    tokio::time::sleep(delay).await;
                }
                let units = params[0].as_array().cloned().unwrap_or_default();
                for unit in units {
                    let number = unit
                        .get("number")
                        .or_else(|| unit.get("blockNumber"))
                        .and_then(|n| parse_u64(n, method).ok().or_else(|| n.as_u64()));
                    if let Some(number) = number {
                        self.blocks
                            .lock()
                            .unwrap()
                            .entry(number)
                            .or_insert_with(|| unit.clone());
                    }
                    self.imported.lock().unwrap().push(unit);
                }
                Ok(Value::Bool(true))
            }
            "eth_sendRawTransaction" => {
                let raw = params[0].as_str().unwrap_or_default().to_string();
                self.raw_transactions.lock().unwrap().push(raw.clone());
                Ok(json!(format!("{:#x}", keccak256(raw.as_bytes()))))
            }
            _ => Err(RpcError::Rejected {
                method: method.to_string(),
                code: -32601,
                message: format!("the method {method} does not exist"),
            }),
        }
    }
}
