//! Submission of blocks to a live node.
//!
//! Units flow through one bounded channel into a pool of workers. Each worker
//! checks whether the node already has the block, submits it and records the
//! result in the shared [`MigrationCounters`]. Workers never stop the pool on
//! a per-unit failure.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::WriteOutcome;
use crate::{
    error::{MigrationError, WriteError},
    progress::MigrationCounters,
    rpc::ChainRpc,
    transport::TransportEntry,
};

pub const MAX_IMPORT_WORKERS: usize = 50;
pub const WORK_CHANNEL_CAPACITY: usize = 100;
pub const DEFAULT_IMPORT_METHOD: &str = "migrate_importBlocks";

/// How a unit is handed to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportMethod {
    /// Administrative bulk import, called with `[[unit]]`.
    Bulk { method: String },
    /// `eth_sendRawTransaction` for every transaction carrying a `raw` field.
    RawTransactions,
}

impl Default for ImportMethod {
    fn default() -> Self {
        ImportMethod::Bulk {
            method: DEFAULT_IMPORT_METHOD.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    pub workers: usize,
    pub skip_existing: bool,
    pub dry_run: bool,
}

pub struct RpcSubmitter {
    client: Arc<dyn ChainRpc>,
    method: ImportMethod,
    options: SubmitOptions,
    counters: Arc<MigrationCounters>,
}

impl RpcSubmitter {
    pub fn new(
        client: Arc<dyn ChainRpc>,
        method: ImportMethod,
        options: SubmitOptions,
        counters: Arc<MigrationCounters>,
    ) -> Self {
        Self {
            client,
            method,
            options: SubmitOptions {
                workers: options.workers.clamp(1, MAX_IMPORT_WORKERS),
                ..options
            },
            counters,
        }
    }

    pub fn workers(&self) -> usize {
        self.options.workers
    }

    /// Submits one unit and updates the counters.
    pub async fn submit(&self, unit: &TransportEntry) -> Result<WriteOutcome, WriteError> {
        let result = self.try_submit(unit).await;
        match &result {
            Ok(WriteOutcome::Skipped) => self.counters.add_skipped(1),
            Ok(_) => self.counters.add_imported(1),
            Err(error) => {
                self.counters.add_errors(1);
                let rejected = matches!(error, WriteError::Submit { source, .. } if source.is_rejection());
                warn!(
                    block = ?unit.block_number(),
                    hash = ?unit.block_hash(),
                    rejected,
                    %error,
                    "Failed to submit block"
                );
            }
        }
        result
    }

    async fn try_submit(&self, unit: &TransportEntry) -> Result<WriteOutcome, WriteError> {
        if self.options.dry_run {
            return Ok(WriteOutcome::DryRun);
        }
        let submit_error = |source| WriteError::Submit {
            number: unit.block_number(),
            hash: unit.block_hash(),
            source,
        };

        if self.options.skip_existing
            && let Some(number) = unit.block_number()
        {
            match self.client.block_exists(number).await {
                Ok(true) => return Ok(WriteOutcome::Skipped),
                Ok(false) => {}
                Err(error) => debug!(block = number, %error, "Existence check failed, submitting anyway"),
            }
        }

        match &self.method {
            ImportMethod::Bulk { method } => {
                let payload = unit_payload(unit);
                self.client
                    .call(method, json!([[payload]]))
                    .await
                    .map_err(submit_error)?;
            }
            ImportMethod::RawTransactions => {
                let TransportEntry::RpcBlock(block) = unit else {
                    return Err(WriteError::Unsupported(format!(
                        "raw transaction submission of {}",
                        describe(unit)
                    )));
                };
                for raw in block.raw_transactions() {
                    self.client
                        .call("eth_sendRawTransaction", json!([raw]))
                        .await
                        .map_err(submit_error)?;
                }
            }
        }
        Ok(WriteOutcome::Written)
    }

    /// Starts the worker pool. Units are sent through the returned handle.
    pub fn start(self, cancel: CancellationToken) -> SubmitHandle {
        let (tx, rx) = mpsc::channel(WORK_CHANNEL_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        let submitter = Arc::new(self);
        let mut workers = JoinSet::new();

        for worker in 0..submitter.workers() {
            let submitter = submitter.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker, "Submit worker cancelled");
                        return;
                    }
                    let Some(unit) = rx.lock().await.recv().await else {
                        return;
                    };
                    // Failures are counted inside `submit`.
                    let _ = submitter.submit(&unit).await;
                }
            });
        }

        SubmitHandle { tx, workers }
    }
}

fn unit_payload(unit: &TransportEntry) -> Value {
    match unit {
        TransportEntry::RpcBlock(block) => block.body.clone(),
        TransportEntry::Record(record) => serde_json::to_value(record).unwrap_or(Value::Null),
    }
}

fn describe(unit: &TransportEntry) -> String {
    match unit {
        TransportEntry::RpcBlock(block) => format!("RPC block #{}", block.number),
        TransportEntry::Record(record) => record.to_string(),
    }
}

/// Feeding side of a running submit pool.
pub struct SubmitHandle {
    tx: mpsc::Sender<TransportEntry>,
    workers: JoinSet<()>,
}

impl SubmitHandle {
    pub fn sender(&self) -> mpsc::Sender<TransportEntry> {
        self.tx.clone()
    }

    /// Closes the channel and waits for every worker to drain it.
    pub async fn finish(self) -> Result<(), MigrationError> {
        let Self { tx, mut workers } = self;
        drop(tx);
        while let Some(joined) = workers.join_next().await {
            joined.map_err(|e| MigrationError::TaskPanicked(e.to_string()))?;
        }
        Ok(())
    }
}
