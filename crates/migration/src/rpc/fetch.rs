//! Parallel block fetching for RPC export.
//!
//! Worker `i` of `n` fetches `start + i`, `start + i + n`, ... and sends each
//! block into one bounded channel. Blocks therefore arrive out of order.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ChainRpc;
use crate::{progress::MigrationCounters, transport::RpcBlock};

pub const MAX_FETCH_WORKERS: usize = 200;
pub const FETCH_CHANNEL_CAPACITY: usize = 100;

/// Blocks `start..=end` to fetch with a given worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub start: u64,
    pub end: u64,
    pub workers: usize,
}

impl FetchPlan {
    pub fn new(start: u64, end: u64, workers: usize) -> Self {
        Self {
            start,
            end,
            workers: workers.clamp(1, MAX_FETCH_WORKERS),
        }
    }

    /// Heights assigned to `worker`.
    pub fn assignments(&self, worker: usize) -> impl Iterator<Item = u64> + use<> {
        let first = self.start.checked_add(worker as u64);
        let end = self.end;
        let step = self.workers as u64;
        std::iter::successors(first, move |n| n.checked_add(step)).take_while(move |n| *n <= end)
    }

    pub fn total(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }
}

/// Starts the fetch workers. The receiver closes once every worker is done.
///
/// Fetch failures and missing blocks are counted as errors and do not stop
/// the other workers.
pub fn spawn_fetch_pool(
    client: Arc<dyn ChainRpc>,
    plan: FetchPlan,
    counters: Arc<MigrationCounters>,
    cancel: CancellationToken,
) -> (mpsc::Receiver<RpcBlock>, JoinSet<()>) {
    let (tx, rx) = mpsc::channel(FETCH_CHANNEL_CAPACITY);
    let mut workers = JoinSet::new();

    for worker in 0..plan.workers {
        let client = client.clone();
        let counters = counters.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();
        workers.spawn(async move {
            for number in plan.assignments(worker) {
                if cancel.is_cancelled() {
                    debug!(worker, "Fetch worker cancelled");
                    return;
                }
                let block = match client.require_block(number, true).await {
                    Ok(body) => RpcBlock::from_value(body),
                    Err(error) => {
                        warn!(block = number, %error, "Failed to fetch block");
                        counters.add_errors(1);
                        continue;
                    }
                };
                match block {
                    Ok(block) => {
                        // A full channel must not outlive cancellation.
                        let sent = tokio::select! {
                            sent = tx.send(block) => sent.is_ok(),
                            _ = cancel.cancelled() => false,
                        };
                        if !sent {
                            debug!(worker, "Fetch worker stopped while sending");
                            return;
                        }
                    }
                    Err(error) => {
                        warn!(block = number, %error, "Node returned a malformed block");
                        counters.add_decode_errors(1);
                    }
                }
            }
        });
    }

    (rx, workers)
}
