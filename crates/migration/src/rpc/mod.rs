//! JSON-RPC access to live nodes: the [`ChainRpc`] seam, the HTTP client and
//! the block fetch pool used by RPC export.

mod client;
mod error;
pub mod fetch;

use async_trait::async_trait;
use ethereum_types::H256;
use serde_json::{Value, json};

pub use client::{HttpRpcClient, RpcConfig};
pub use error::RpcError;

/// Minimal node surface the migration needs.
///
/// Only [`ChainRpc::call`] is required; the typed helpers are built on it.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    async fn block_number(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_u64(&result, "eth_blockNumber")
    }

    /// `eth_getBlockByNumber`, `None` when the node returns `null`.
    async fn block_by_number(&self, number: u64, full: bool) -> Result<Option<Value>, RpcError> {
        let result = self
            .call("eth_getBlockByNumber", json!([format!("0x{number:x}"), full]))
            .await?;
        Ok((!result.is_null()).then_some(result))
    }

    /// Like [`ChainRpc::block_by_number`], but a `null` answer is an error.
    async fn require_block(&self, number: u64, full: bool) -> Result<Value, RpcError> {
        self.block_by_number(number, full)
            .await?
            .ok_or(RpcError::MissingBlock { number })
    }

    async fn block_exists(&self, number: u64) -> Result<bool, RpcError> {
        Ok(self.block_by_number(number, false).await?.is_some())
    }
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_u64(value: &Value, method: &str) -> Result<u64, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::malformed(method, "u64", "expected hex string"))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| RpcError::malformed(method, "u64", e.to_string()))
}

pub fn parse_h256(value: &Value, method: &str) -> Result<H256, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::malformed(method, "hash", "expected hex string"))?;
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| RpcError::malformed(method, "hash", e.to_string()))?;
    if bytes.len() != 32 {
        return Err(RpcError::malformed(
            method,
            "hash",
            format!("expected 32 bytes, got {}", bytes.len()),
        ));
    }
    Ok(H256::from_slice(&bytes))
}
