/// Failure talking to a node on either side of a migration.
///
/// A node refusing a submitted unit is [`RpcError::Rejected`]; a node that
/// simply does not have a requested block is [`RpcError::MissingBlock`]. Only
/// transport-level failures are worth another attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("cannot reach node at {url}: {cause}")]
    Unreachable { url: String, cause: String },

    #[error("{method} got no answer within {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("node answered {method} with HTTP {status}")]
    Http {
        method: String,
        status: u16,
        /// Seconds from the `Retry-After` header.
        retry_after: Option<u64>,
    },

    #[error("node rejected {method} ({code}): {message}")]
    Rejected {
        method: String,
        code: i64,
        message: String,
    },

    #[error("node has no block #{number}")]
    MissingBlock { number: u64 },

    #[error("malformed {field} in {method} response: {cause}")]
    Malformed {
        method: String,
        field: String,
        cause: String,
    },

    #[error("{method} gave up after {attempts} attempt(s): {last}")]
    GaveUp {
        method: String,
        attempts: u32,
        last: Box<RpcError>,
    },
}

impl RpcError {
    /// Whether another attempt at the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Unreachable { .. } | RpcError::Timeout { .. } => true,
            // Rate limited or a gateway in front of the node.
            RpcError::Http { status, .. } => *status == 429 || (502..=504).contains(status),
            RpcError::GaveUp { last, .. } => last.is_transient(),
            _ => false,
        }
    }

    /// The node understood the call and refused it.
    pub fn is_rejection(&self) -> bool {
        match self {
            RpcError::Rejected { .. } => true,
            RpcError::GaveUp { last, .. } => last.is_rejection(),
            _ => false,
        }
    }

    pub(crate) fn malformed(method: &str, field: &str, cause: impl Into<String>) -> Self {
        RpcError::Malformed {
            method: method.to_string(),
            field: field.to_string(),
            cause: cause.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_failures_are_transient_and_rejections_are_not() {
        let overloaded = RpcError::Http {
            method: "eth_getBlockByNumber".into(),
            status: 503,
            retry_after: None,
        };
        assert!(overloaded.is_transient());
        assert!(!overloaded.is_rejection());

        let rejected = RpcError::Rejected {
            method: "migrate_importBlocks".into(),
            code: -32000,
            message: "invalid parent hash".into(),
        };
        assert!(!rejected.is_transient());
        assert!(rejected.is_rejection());

        assert!(!RpcError::MissingBlock { number: 12 }.is_transient());
    }

    #[test]
    fn exhausted_retries_keep_the_last_failure_kind() {
        let gave_up = RpcError::GaveUp {
            method: "eth_blockNumber".into(),
            attempts: 4,
            last: Box::new(RpcError::Timeout {
                method: "eth_blockNumber".into(),
                timeout_ms: 30_000,
            }),
        };
        assert!(gave_up.is_transient());
        assert!(!gave_up.is_rejection());
        assert_eq!(
            gave_up.to_string(),
            "eth_blockNumber gave up after 4 attempt(s): eth_blockNumber got no answer within 30000ms"
        );
    }
}
