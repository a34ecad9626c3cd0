//! JSON-RPC HTTP client for the nodes on either side of a migration.
//!
//! Transient failures are retried with exponential backoff. A `Retry-After`
//! header on a rate-limited answer overrides the backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{ChainRpc, RpcError};

/// Configuration for RPC client behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// Per-request timeout (default: 30s).
    pub timeout: Duration,
    /// TCP connect timeout (default: 10s).
    pub connect_timeout: Duration,
    /// Maximum retry attempts for transient errors (default: 3).
    pub max_retries: u32,
    /// Base backoff duration, doubled on each retry (default: 1s).
    pub base_backoff: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRpcClient {
    http: reqwest::Client,
    url: String,
    config: RpcConfig,
}

impl HttpRpcClient {
    pub fn new(url: &str) -> Self {
        Self::with_config(url, RpcConfig::default())
    }

    pub fn with_config(url: &str, config: RpcConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            url: url.to_string(),
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    fn backoff_for(&self, attempt: u32, last_error: Option<&RpcError>) -> Duration {
        let exponential = self.config.base_backoff * 2u32.saturating_pow(attempt - 1);
        match last_error {
            Some(RpcError::Http {
                retry_after: Some(secs),
                ..
            }) => Duration::from_secs(*secs),
            _ => exponential,
        }
    }

    /// Executes a JSON-RPC call with retry and backoff.
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let max_attempts = self.config.max_retries + 1;
        let mut last_error: Option<RpcError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = self.backoff_for(attempt, last_error.as_ref());
                debug!(method, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying RPC call");
                tokio::time::sleep(backoff).await;
            }

            match self.rpc_call_once(method, &body).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_transient() || attempt + 1 >= max_attempts {
                        if attempt > 0 {
                            return Err(RpcError::GaveUp {
                                method: method.into(),
                                attempts: attempt + 1,
                                last: Box::new(err),
                            });
                        }
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(RpcError::GaveUp {
            method: method.into(),
            attempts: max_attempts,
            last: Box::new(last_error.unwrap_or_else(|| RpcError::Unreachable {
                url: self.url.clone(),
                cause: "no attempt was made".into(),
            })),
        })
    }

    /// Single attempt at an RPC call (no retry).
    async fn rpc_call_once(&self, method: &str, body: &Value) -> Result<Value, RpcError> {
        let response = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout {
                        method: method.into(),
                        timeout_ms: self.config.timeout.as_millis() as u64,
                    }
                } else {
                    RpcError::Unreachable {
                        url: self.url.clone(),
                        cause: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(RpcError::Http {
                method: method.into(),
                status: status.as_u16(),
                retry_after,
            });
        }

        let json_response: Value = response
            .json()
            .await
            .map_err(|e| RpcError::malformed(method, "response_body", e.to_string()))?;
        extract_result(method, json_response)
    }
}

/// Splits a JSON-RPC response envelope into its result or the node's refusal.
pub(crate) fn extract_result(method: &str, mut response: Value) -> Result<Value, RpcError> {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        return Err(RpcError::Rejected {
            method: method.into(),
            code,
            message,
        });
    }

    response
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| RpcError::malformed(method, "result", "missing result field"))
}

#[async_trait]
impl ChainRpc for HttpRpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.rpc_call(method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_error_is_a_rejection() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "the method migrate_importBlocks does not exist"}
        });
        let err = extract_result("migrate_importBlocks", response).unwrap_err();
        assert!(matches!(err, RpcError::Rejected { code: -32601, .. }));
        assert!(err.is_rejection());
    }

    #[test]
    fn null_result_is_kept() {
        let response = json!({"jsonrpc": "2.0", "id": 1, "result": null});
        assert_eq!(
            extract_result("eth_getBlockByNumber", response).unwrap(),
            Value::Null
        );

        let missing = json!({"jsonrpc": "2.0", "id": 1});
        assert!(matches!(
            extract_result("eth_blockNumber", missing),
            Err(RpcError::Malformed { .. })
        ));
    }

    #[test]
    fn backoff_doubles_and_honors_retry_after() {
        let client = HttpRpcClient::with_config(
            "http://127.0.0.1:8545",
            RpcConfig {
                base_backoff: Duration::from_millis(100),
                ..RpcConfig::default()
            },
        );
        assert_eq!(client.backoff_for(1, None), Duration::from_millis(100));
        assert_eq!(client.backoff_for(3, None), Duration::from_millis(400));

        let limited = RpcError::Http {
            method: "eth_blockNumber".into(),
            status: 429,
            retry_after: Some(2),
        };
        assert_eq!(
            client.backoff_for(1, Some(&limited)),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn unreachable_node_is_a_connection_failure() {
        let client = HttpRpcClient::with_config(
            "http://127.0.0.1:1",
            RpcConfig {
                max_retries: 0,
                connect_timeout: Duration::from_millis(200),
                ..RpcConfig::default()
            },
        );
        let err = client.block_number().await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable { .. }), "unexpected error: {err}");
        assert!(err.is_transient());
    }
}
