//! Sequencing of one migration run.
//!
//! Every source/destination pair goes through the same steps: read, decode,
//! filter, write, reconcile the head, verify, summarize. Local backends meet
//! through [`RecordSource`] and [`RecordSink`] on one blocking thread; RPC
//! endpoints use the fetch pool and the submit pool instead.
//!
//! | Source \ Destination | Store      | Transport       | RPC                 |
//! |----------------------|------------|-----------------|---------------------|
//! | Store                | sequential | sequential      | producer + submit   |
//! | Transport            | sequential | sequential      | producer + submit   |
//! | RPC                  | rejected   | fetch + writer  | fetch + submit      |

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use ledger_storage::{EngineType, InMemoryBackend, OpenMode, StorageBackend, open_backend};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{MigrationError, WriteError},
    head::{ChainHeadPointer, HeadReconciler, HeadStrategy, head_from_rpc, head_from_store},
    job::{BlockRange, DestinationDescriptor, MigrationJob, SourceDescriptor, StoreLocation},
    progress::{CounterSnapshot, MigrationCounters, ProgressReporter, spawn_progress_ticker, throughput},
    reader::{SourceReader, SourceRecords},
    rpc::{
        ChainRpc, HttpRpcClient,
        fetch::{FetchPlan, spawn_fetch_pool},
    },
    transport::{Compression, ExportMetadata, TransportEntry, TransportReader, TransportWriter},
    verify::{VerificationReport, Verifier},
    writer::{
        DirectWriter, ImportMethod, RpcSubmitter, SubmitOptions, TransportSink, WriteOutcome,
        WriteStats, WriterOptions,
    },
};

/// Per-pass counters a source keeps about what it could not hand out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub decode_errors: u64,
    pub unclassified: u64,
    pub foreign_namespace: u64,
    pub ignored: u64,
}

/// Anything that yields transport entries in order.
pub trait RecordSource {
    /// Next entry, `None` at the end. Only unrecoverable failures are errors.
    fn next_entry(&mut self) -> Result<Option<TransportEntry>, MigrationError>;

    fn counts(&self) -> SourceCounts;
}

/// Anything that accepts entries one at a time.
pub trait RecordSink {
    /// Per-entry failures are counted by the sink before being returned.
    fn accept(&mut self, entry: &TransportEntry) -> Result<WriteOutcome, WriteError>;

    fn flush(&mut self) -> Result<(), WriteError>;

    fn stats(&self) -> WriteStats;
}

impl RecordSource for SourceRecords<'_> {
    fn next_entry(&mut self) -> Result<Option<TransportEntry>, MigrationError> {
        self.next()
            .transpose()
            .map(|record| record.map(TransportEntry::Record))
    }

    fn counts(&self) -> SourceCounts {
        let stats = self.stats();
        SourceCounts {
            unclassified: stats.unclassified,
            foreign_namespace: stats.foreign_namespace,
            ..Default::default()
        }
    }
}

impl RecordSource for TransportReader {
    fn next_entry(&mut self) -> Result<Option<TransportEntry>, MigrationError> {
        TransportReader::next_entry(self)
    }

    fn counts(&self) -> SourceCounts {
        let stats = self.stats();
        SourceCounts {
            decode_errors: stats.decode_errors,
            ignored: stats.ignored,
            ..Default::default()
        }
    }
}

impl RecordSink for DirectWriter {
    fn accept(&mut self, entry: &TransportEntry) -> Result<WriteOutcome, WriteError> {
        self.write_entry(entry)
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        DirectWriter::flush(self)
    }

    fn stats(&self) -> WriteStats {
        DirectWriter::stats(self)
    }
}

impl RecordSink for TransportSink {
    fn accept(&mut self, entry: &TransportEntry) -> Result<WriteOutcome, WriteError> {
        self.write(entry)
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        Ok(())
    }

    fn stats(&self) -> WriteStats {
        TransportSink::stats(self)
    }
}

/// Which entries a run keeps.
#[derive(Debug, Clone, Copy)]
struct EntryFilter {
    range: BlockRange,
    include_state: bool,
}

impl EntryFilter {
    fn admits(&self, entry: &TransportEntry) -> bool {
        if entry.is_state() {
            return self.include_state;
        }
        entry
            .block_number()
            .is_none_or(|number| self.range.contains(number))
    }
}

#[derive(Debug, Default)]
struct PassOutcome {
    counts: SourceCounts,
    writes: WriteStats,
    filtered: u64,
    highest: Option<ChainHeadPointer>,
    lines_written: Option<u64>,
}

/// Drives `source` into `sink` until the source ends or the run is cancelled.
///
/// Cancellation is checked before the first entry and then every
/// `check_every` entries, so no batch starts once the run is cancelled.
fn run_pass(
    source: &mut dyn RecordSource,
    sink: &mut dyn RecordSink,
    filter: EntryFilter,
    check_every: u64,
    cancel: &CancellationToken,
    destination: &Path,
) -> Result<PassOutcome, MigrationError> {
    let mut reporter = ProgressReporter::new("migrate");
    let mut seen = 0u64;
    let mut filtered = 0u64;
    let fatal = |source| MigrationError::TransportIo {
        path: destination.to_path_buf(),
        source,
    };

    loop {
        if seen % check_every == 0 && cancel.is_cancelled() {
            info!(seen, "Cancellation requested, stopping at batch boundary");
            break;
        }
        let Some(entry) = source.next_entry()? else {
            break;
        };
        seen += 1;
        if !filter.admits(&entry) {
            filtered += 1;
            continue;
        }
        match sink.accept(&entry) {
            Ok(_) => {}
            Err(WriteError::TransportIo(error)) => return Err(fatal(error)),
            // Already counted and logged by the sink.
            Err(_) => {}
        }
        reporter.tick(snapshot(source.counts(), sink.stats()));
    }

    match sink.flush() {
        Ok(()) | Err(WriteError::Commit { .. }) => {}
        Err(WriteError::TransportIo(error)) => return Err(fatal(error)),
        Err(error) => warn!(%error, "Final flush failed"),
    }

    Ok(PassOutcome {
        counts: source.counts(),
        writes: sink.stats(),
        filtered,
        ..Default::default()
    })
}

fn snapshot(counts: SourceCounts, writes: WriteStats) -> CounterSnapshot {
    CounterSnapshot {
        imported: writes.written,
        skipped: writes.skipped,
        errors: writes.errors,
        decode_errors: counts.decode_errors,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub status: RunStatus,
    pub source: String,
    pub destination: String,
    pub dry_run: bool,
    pub imported: u64,
    pub skipped: u64,
    pub errors: u64,
    pub decode_errors: u64,
    pub unclassified: u64,
    pub foreign_namespace: u64,
    pub ignored: u64,
    /// Entries outside the block range or state entries left out.
    pub filtered: u64,
    pub commits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines_written: Option<u64>,
    pub head: Option<ChainHeadPointer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    /// Height reported by an RPC destination after the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_height: Option<u64>,
    pub elapsed_ms: u64,
    /// Imported entries per second.
    pub throughput: f64,
}

pub struct Orchestrator {
    job: MigrationJob,
    cancel: CancellationToken,
    stores: HashMap<PathBuf, Arc<dyn StorageBackend>>,
    clients: HashMap<String, Arc<dyn ChainRpc>>,
}

impl Orchestrator {
    pub fn new(job: MigrationJob) -> Self {
        Self {
            job,
            cancel: CancellationToken::new(),
            stores: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Uses an already open backend for the store at `path`.
    pub fn with_store(mut self, path: impl Into<PathBuf>, backend: Arc<dyn StorageBackend>) -> Self {
        self.stores.insert(path.into(), backend);
        self
    }

    /// Uses `client` for every call to `url`.
    pub fn with_rpc(mut self, url: impl Into<String>, client: Arc<dyn ChainRpc>) -> Self {
        self.clients.insert(url.into(), client);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn job(&self) -> &MigrationJob {
        &self.job
    }

    fn rpc_client(&self, url: &str) -> Arc<dyn ChainRpc> {
        self.clients.get(url).cloned().unwrap_or_else(|| {
            Arc::new(HttpRpcClient::with_config(url, self.job.rpc.clone()))
        })
    }

    fn open_source_store(&self, location: &StoreLocation) -> Result<Arc<dyn StorageBackend>, MigrationError> {
        if let Some(backend) = self.stores.get(&location.path) {
            return Ok(backend.clone());
        }
        open_backend(&location.path, location.engine, OpenMode::ReadOnly).map_err(|source| {
            MigrationError::FatalOpen {
                role: "source",
                path: location.path.clone(),
                source,
            }
        })
    }

    /// A dry run never creates a missing destination: it checks existence
    /// against an empty store instead.
    fn open_destination_store(
        &self,
        location: &StoreLocation,
    ) -> Result<Arc<dyn StorageBackend>, MigrationError> {
        if let Some(backend) = self.stores.get(&location.path) {
            return Ok(backend.clone());
        }
        let mode = if self.job.dry_run {
            if location.engine == EngineType::InMemory || !location.path.exists() {
                return Ok(Arc::new(InMemoryBackend::new()));
            }
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        open_backend(&location.path, location.engine, mode).map_err(|source| MigrationError::FatalOpen {
            role: "destination",
            path: location.path.clone(),
            source,
        })
    }

    pub async fn run(self) -> Result<MigrationSummary, MigrationError> {
        self.job.validate()?;
        let started = Instant::now();
        let _deadline = self.spawn_deadline();
        info!(
            source = %self.job.source,
            destination = %self.job.destination,
            dry_run = self.job.dry_run,
            "Starting migration"
        );

        let source_store = match &self.job.source {
            SourceDescriptor::Store(location) => Some(self.open_source_store(location)?),
            _ => None,
        };
        let destination_store = match &self.job.destination {
            DestinationDescriptor::Store(location) => Some(self.open_destination_store(location)?),
            _ => None,
        };

        let pass = match (&self.job.source, &self.job.destination) {
            (SourceDescriptor::Rpc { url }, DestinationDescriptor::Transport { path, compression }) => {
                self.rpc_export(url, path, *compression).await?
            }
            (SourceDescriptor::Rpc { url }, DestinationDescriptor::Rpc { url: to, method }) => {
                self.rpc_relay(url, to, method).await?
            }
            (SourceDescriptor::Rpc { .. }, DestinationDescriptor::Store(_)) => {
                return Err(MigrationError::InvalidJob("RPC to store is not supported".into()));
            }
            (_, DestinationDescriptor::Rpc { url, method }) => {
                self.submit_from_local(source_store.clone(), url, method).await?
            }
            _ => {
                self.sequential(source_store.clone(), destination_store.clone())
                    .await?
            }
        };

        let cancelled = self.cancel.is_cancelled();
        let mut summary = MigrationSummary {
            status: if cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            },
            source: self.job.source.to_string(),
            destination: self.job.destination.to_string(),
            dry_run: self.job.dry_run,
            imported: pass.writes.written,
            skipped: pass.writes.skipped,
            errors: pass.writes.errors,
            decode_errors: pass.counts.decode_errors,
            unclassified: pass.counts.unclassified,
            foreign_namespace: pass.counts.foreign_namespace,
            ignored: pass.counts.ignored,
            filtered: pass.filtered,
            commits: pass.writes.commits,
            lines_written: pass.lines_written,
            head: None,
            verification: None,
            destination_height: None,
            elapsed_ms: 0,
            throughput: 0.0,
        };

        if let (Some(destination), DestinationDescriptor::Store(location)) =
            (destination_store, &self.job.destination)
        {
            if cancelled {
                warn!("Run cancelled, head markers left untouched");
            } else if self.job.dry_run {
                info!(head = ?pass.highest, "Dry run, head markers not written");
            } else {
                summary.head = self
                    .reconcile_head(destination.clone(), location, source_store, pass.highest)
                    .await?;
            }

            if self.job.verify && !self.job.dry_run && !cancelled {
                let last = summary
                    .head
                    .or(pass.highest)
                    .map(|head| head.last_block_number);
                match last {
                    Some(last) => {
                        let codec = location.codec();
                        summary.verification =
                            Some(Verifier::new(destination.as_ref(), &codec).verify(last));
                    }
                    None => warn!("No head known, skipping verification"),
                }
            }
        }

        if let DestinationDescriptor::Rpc { url, .. } = &self.job.destination
            && self.job.verify
            && !self.job.dry_run
        {
            match self.rpc_client(url).block_number().await {
                Ok(height) => {
                    info!(height, "Destination height after import");
                    summary.destination_height = Some(height);
                }
                Err(error) => warn!(%error, "Could not read destination height"),
            }
        }

        let elapsed = started.elapsed();
        summary.elapsed_ms = elapsed.as_millis() as u64;
        summary.throughput = throughput(summary.imported, elapsed);
        info!(
            status = ?summary.status,
            imported = summary.imported,
            skipped = summary.skipped,
            errors = summary.errors,
            decode_errors = summary.decode_errors,
            elapsed_ms = summary.elapsed_ms,
            "Migration finished"
        );
        Ok(summary)
    }

    /// Cancels the run once the job's deadline passes. The returned guard
    /// stops the timer when dropped.
    fn spawn_deadline(&self) -> Option<tokio_util::sync::DropGuard> {
        let deadline = self.job.deadline?;
        let finished = CancellationToken::new();
        let cancel = self.cancel.clone();
        let stop = finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    warn!(deadline_secs = deadline.as_secs(), "Deadline reached, cancelling run");
                    cancel.cancel();
                }
                _ = stop.cancelled() => {}
            }
        });
        Some(finished.drop_guard())
    }

    fn filter(&self) -> EntryFilter {
        EntryFilter {
            range: self.job.block_range,
            include_state: self.job.include_state,
        }
    }

    fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            batch_size: self.job.batch_size,
            skip_existing: self.job.skip_existing,
            dry_run: self.job.dry_run,
        }
    }

    fn export_metadata(&self, source_store: Option<&Arc<dyn StorageBackend>>) -> ExportMetadata {
        let end = self.job.block_range.end.or_else(|| {
            let (store, location) = source_store.zip(self.job.source_store())?;
            head_from_store(store.as_ref(), &location.codec())
                .ok()
                .map(|head| head.last_block_number)
        });
        ExportMetadata::new(self.job.source.to_string(), self.job.block_range.start, end)
    }

    /// Store or transport source into store or transport destination.
    async fn sequential(
        &self,
        source_store: Option<Arc<dyn StorageBackend>>,
        destination_store: Option<Arc<dyn StorageBackend>>,
    ) -> Result<PassOutcome, MigrationError> {
        let job = self.job.clone();
        let filter = self.filter();
        let options = self.writer_options();
        let cancel = self.cancel.clone();
        let metadata = self.export_metadata(source_store.as_ref());

        let task = tokio::task::spawn_blocking(move || {
            let check_every = job.batch_size.max(1) as u64;
            let destination_path = match &job.destination {
                DestinationDescriptor::Store(location) => location.path.clone(),
                DestinationDescriptor::Transport { path, .. } => path.clone(),
                DestinationDescriptor::Rpc { url, .. } => PathBuf::from(url),
            };

            let mut sink = match (&job.destination, destination_store) {
                (DestinationDescriptor::Store(location), Some(backend)) => {
                    LocalSink::Store(DirectWriter::new(backend, location.codec(), options))
                }
                (DestinationDescriptor::Transport { path, compression }, _) if !job.dry_run => {
                    let writer = TransportWriter::create(path, *compression)?;
                    LocalSink::Transport(TransportSink::new(writer, &metadata)?)
                }
                (DestinationDescriptor::Transport { .. }, _) => {
                    LocalSink::Transport(TransportSink::dry_run())
                }
                _ => {
                    return Err(MigrationError::InvalidJob(
                        "destination is not a store or transport file".into(),
                    ));
                }
            };

            let mut outcome = match (&job.source, source_store) {
                (SourceDescriptor::Store(location), Some(backend)) => {
                    let reader = SourceReader::from_backend(backend, location.codec());
                    let mut records = reader.records()?;
                    run_pass(&mut records, sink.as_dyn(), filter, check_every, &cancel, &destination_path)?
                }
                (SourceDescriptor::Transport { path }, _) => {
                    let mut reader = TransportReader::open(path)?;
                    run_pass(&mut reader, sink.as_dyn(), filter, check_every, &cancel, &destination_path)?
                }
                _ => {
                    return Err(MigrationError::InvalidJob(
                        "source is not a store or transport file".into(),
                    ));
                }
            };

            match sink {
                LocalSink::Store(writer) => outcome.highest = writer.highest_block(),
                LocalSink::Transport(sink) => outcome.lines_written = Some(sink.finish()?),
            }
            Ok(outcome)
        });
        task.await
            .map_err(|e| MigrationError::TaskPanicked(e.to_string()))?
    }

    /// Store or transport source into the submit pool of an RPC destination.
    async fn submit_from_local(
        &self,
        source_store: Option<Arc<dyn StorageBackend>>,
        url: &str,
        method: &ImportMethod,
    ) -> Result<PassOutcome, MigrationError> {
        let counters = Arc::new(MigrationCounters::default());
        let handle = RpcSubmitter::new(
            self.rpc_client(url),
            method.clone(),
            self.submit_options(),
            counters.clone(),
        )
        .start(self.cancel.clone());
        let tx = handle.sender();
        let source = self.job.source.clone();
        let filter = self.filter();
        let cancel = self.cancel.clone();

        let producer: JoinHandle<Result<(SourceCounts, u64), MigrationError>> =
            tokio::task::spawn_blocking(move || {
                let mut filtered = 0;
                let mut feed = |source: &mut dyn RecordSource| -> Result<SourceCounts, MigrationError> {
                    while let Some(entry) = source.next_entry()? {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if !filter.admits(&entry) {
                            filtered += 1;
                            continue;
                        }
                        if tx.blocking_send(entry).is_err() {
                            break;
                        }
                    }
                    Ok(source.counts())
                };
                let counts = match (&source, source_store) {
                    (SourceDescriptor::Store(location), Some(backend)) => {
                        let reader = SourceReader::from_backend(backend, location.codec());
                        let mut records = reader.records()?;
                        feed(&mut records)?
                    }
                    (SourceDescriptor::Transport { path }, _) => feed(&mut TransportReader::open(path)?)?,
                    _ => {
                        return Err(MigrationError::InvalidJob(
                            "source is not a store or transport file".into(),
                        ));
                    }
                };
                Ok((counts, filtered))
            });

        let stop = CancellationToken::new();
        let ticker = spawn_progress_ticker("submit", counters.clone(), stop.clone());
        let produced = producer
            .await
            .map_err(|e| MigrationError::TaskPanicked(e.to_string()));
        let drained = handle.finish().await;
        stop.cancel();
        let _ = ticker.await;
        let (counts, filtered) = produced??;
        drained?;

        let snapshot = counters.snapshot();
        Ok(PassOutcome {
            counts,
            writes: WriteStats {
                written: snapshot.imported,
                skipped: snapshot.skipped,
                errors: snapshot.errors,
                commits: 0,
            },
            filtered,
            ..Default::default()
        })
    }

    fn submit_options(&self) -> SubmitOptions {
        SubmitOptions {
            workers: self.job.worker_count,
            skip_existing: self.job.skip_existing,
            dry_run: self.job.dry_run,
        }
    }

    async fn fetch_plan(&self, client: &dyn ChainRpc) -> Result<FetchPlan, MigrationError> {
        let end = match self.job.block_range.end {
            Some(end) => end,
            None => {
                let height = client.block_number().await?;
                info!(height, "Exporting up to the node's latest block");
                height
            }
        };
        Ok(FetchPlan::new(
            self.job.block_range.start,
            end,
            self.job.worker_count,
        ))
    }

    /// RPC source into a transport file: fetch pool plus one aggregator.
    async fn rpc_export(
        &self,
        url: &str,
        path: &Path,
        compression: Compression,
    ) -> Result<PassOutcome, MigrationError> {
        let client = self.rpc_client(url);
        let plan = self.fetch_plan(client.as_ref()).await?;
        info!(start = plan.start, end = plan.end, workers = plan.workers, "Fetching blocks");
        let counters = Arc::new(MigrationCounters::default());
        let (mut rx, mut fetchers) =
            spawn_fetch_pool(client, plan, counters.clone(), self.cancel.clone());

        let metadata = ExportMetadata::new(self.job.source.to_string(), plan.start, Some(plan.end));
        let dry_run = self.job.dry_run;
        let path = path.to_path_buf();
        let aggregator_counters = counters.clone();
        let aggregator = tokio::task::spawn_blocking(move || -> Result<u64, MigrationError> {
            let mut sink = if dry_run {
                TransportSink::dry_run()
            } else {
                TransportSink::new(TransportWriter::create(&path, compression)?, &metadata)?
            };
            while let Some(block) = rx.blocking_recv() {
                match sink.write(&TransportEntry::RpcBlock(block)) {
                    Ok(_) => aggregator_counters.add_imported(1),
                    Err(WriteError::TransportIo(source)) => {
                        return Err(MigrationError::TransportIo { path, source });
                    }
                    Err(_) => aggregator_counters.add_errors(1),
                }
            }
            sink.finish()
        });

        let stop = CancellationToken::new();
        let ticker = spawn_progress_ticker("export", counters.clone(), stop.clone());
        while let Some(joined) = fetchers.join_next().await {
            joined.map_err(|e| MigrationError::TaskPanicked(e.to_string()))?;
        }
        let lines = aggregator
            .await
            .map_err(|e| MigrationError::TaskPanicked(e.to_string()))??;
        stop.cancel();
        let _ = ticker.await;

        let snapshot = counters.snapshot();
        Ok(PassOutcome {
            counts: SourceCounts {
                decode_errors: snapshot.decode_errors,
                ..Default::default()
            },
            writes: WriteStats {
                written: snapshot.imported,
                errors: snapshot.errors,
                ..Default::default()
            },
            lines_written: Some(lines),
            ..Default::default()
        })
    }

    /// RPC source into an RPC destination without an intermediate file.
    async fn rpc_relay(&self, from: &str, to: &str, method: &ImportMethod) -> Result<PassOutcome, MigrationError> {
        let source = self.rpc_client(from);
        let plan = self.fetch_plan(source.as_ref()).await?;
        let fetch_counters = Arc::new(MigrationCounters::default());
        let submit_counters = Arc::new(MigrationCounters::default());
        let (mut rx, mut fetchers) =
            spawn_fetch_pool(source, plan, fetch_counters.clone(), self.cancel.clone());
        let handle = RpcSubmitter::new(
            self.rpc_client(to),
            method.clone(),
            self.submit_options(),
            submit_counters.clone(),
        )
        .start(self.cancel.clone());

        let stop = CancellationToken::new();
        let ticker = spawn_progress_ticker("relay", submit_counters.clone(), stop.clone());
        let tx = handle.sender();
        loop {
            let block = tokio::select! {
                block = rx.recv() => block,
                _ = self.cancel.cancelled() => None,
            };
            let Some(block) = block else {
                break;
            };
            if tx.send(TransportEntry::RpcBlock(block)).await.is_err() {
                break;
            }
        }
        // Fetchers blocked on a full channel see it closed.
        drop(rx);
        drop(tx);
        while let Some(joined) = fetchers.join_next().await {
            joined.map_err(|e| MigrationError::TaskPanicked(e.to_string()))?;
        }
        handle.finish().await?;
        stop.cancel();
        let _ = ticker.await;

        let fetched = fetch_counters.snapshot();
        let submitted = submit_counters.snapshot();
        Ok(PassOutcome {
            counts: SourceCounts {
                decode_errors: fetched.decode_errors,
                ..Default::default()
            },
            writes: WriteStats {
                written: submitted.imported,
                skipped: submitted.skipped,
                errors: submitted.errors + fetched.errors,
                commits: 0,
            },
            ..Default::default()
        })
    }

    async fn reconcile_head(
        &self,
        destination: Arc<dyn StorageBackend>,
        location: &StoreLocation,
        source_store: Option<Arc<dyn StorageBackend>>,
        written: Option<ChainHeadPointer>,
    ) -> Result<Option<ChainHeadPointer>, MigrationError> {
        let head = match &self.job.head {
            HeadStrategy::Skip => return Ok(None),
            HeadStrategy::Written => written,
            HeadStrategy::Manual(head) => Some(*head),
            HeadStrategy::FromSource => {
                let (store, source) = source_store
                    .zip(self.job.source_store())
                    .ok_or_else(|| MigrationError::InvalidJob("head from source needs a store source".into()))?;
                Some(head_from_store(store.as_ref(), &source.codec())?)
            }
            HeadStrategy::FromRpc(url) => Some(head_from_rpc(self.rpc_client(url).as_ref()).await?),
        };
        let Some(head) = head else {
            warn!("No header reached the destination, head markers left untouched");
            return Ok(None);
        };

        let reconciler =
            HeadReconciler::new(destination, location.codec(), self.job.resume_dir.clone());
        reconciler.reconcile(head)?;
        Ok(Some(head))
    }
}

enum LocalSink {
    Store(DirectWriter),
    Transport(TransportSink),
}

impl LocalSink {
    fn as_dyn(&mut self) -> &mut dyn RecordSink {
        match self {
            LocalSink::Store(writer) => writer,
            LocalSink::Transport(sink) => sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        head::read_resume_metadata,
        record::LedgerRecord,
        schema::{KeyCodec, LedgerRecordKind, SchemaVersion},
        testing::{MockChain, RECORDS_PER_BLOCK, populate_chain},
    };
    use ethereum_types::H256;
    use std::{io::Write, time::Duration};
    use tempfile::TempDir;

    fn location(path: &str) -> StoreLocation {
        StoreLocation {
            path: PathBuf::from(path),
            engine: EngineType::InMemory,
            schema: SchemaVersion::Rawdb,
            namespace: None,
        }
    }

    fn source_chain(blocks: u64) -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        populate_chain(&backend, &KeyCodec::default(), blocks);
        backend
    }

    async fn export(source: &InMemoryBackend, file: &Path) -> MigrationSummary {
        let job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Transport {
                path: file.to_path_buf(),
                compression: Compression::from_path_hint(file),
            },
        );
        Orchestrator::new(job)
            .with_store("src", Arc::new(source.read_only()))
            .run()
            .await
            .unwrap()
    }

    fn import_job(file: &Path) -> MigrationJob {
        MigrationJob::new(
            SourceDescriptor::Transport {
                path: file.to_path_buf(),
            },
            DestinationDescriptor::Store(location("dest")),
        )
    }

    async fn import(job: MigrationJob, destination: &InMemoryBackend) -> MigrationSummary {
        Orchestrator::new(job)
            .with_store("dest", Arc::new(destination.clone()))
            .run()
            .await
            .unwrap()
    }

    fn count(backend: &InMemoryBackend, kind: LedgerRecordKind) -> u64 {
        SourceReader::from_backend(Arc::new(backend.clone()), KeyCodec::default())
            .count_of_kind(kind)
            .unwrap()
    }

    #[tokio::test]
    async fn export_then_import_round_trips_the_chain() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("chain.jsonl.gz");
        let source = source_chain(1000);

        let exported = export(&source, &file).await;
        assert_eq!(exported.imported, 1000 * RECORDS_PER_BLOCK);
        // Metadata line plus one line per record.
        assert_eq!(exported.lines_written, Some(1 + 1000 * RECORDS_PER_BLOCK));

        let reader = TransportReader::open(&file).unwrap();
        assert_eq!(reader.metadata().unwrap().end_block, Some(999));

        let destination = InMemoryBackend::new();
        let mut job = import_job(&file);
        job.resume_dir = Some(temp_dir.path().to_path_buf());
        let imported = import(job, &destination).await;

        assert_eq!(imported.status, RunStatus::Completed);
        assert_eq!(imported.imported, 1000 * RECORDS_PER_BLOCK);
        assert_eq!(imported.head.unwrap().last_block_number, 999);
        for kind in [LedgerRecordKind::Header, LedgerRecordKind::Body, LedgerRecordKind::Receipts] {
            assert_eq!(count(&destination, kind), count(&source, kind), "{kind}");
        }

        let verification = imported.verification.unwrap();
        assert_eq!(verification.found, verification.checked);
        assert!(verification.is_clean(), "{verification:?}");
        assert_eq!(
            read_resume_metadata(temp_dir.path()).unwrap().map(|h| h.last_block_number),
            Some(999)
        );
    }

    #[tokio::test]
    async fn second_import_skips_everything() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("chain.jsonl");
        export(&source_chain(20), &file).await;

        let destination = InMemoryBackend::new();
        let first = import(import_job(&file), &destination).await;
        let second = import(import_job(&file), &destination).await;

        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped, first.imported);
        assert_eq!(second.head.unwrap().last_block_number, 19);
    }

    #[tokio::test]
    async fn one_corrupt_line_among_a_thousand() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("bodies.jsonl");
        let mut out = std::fs::File::create(&file).unwrap();
        writeln!(
            out,
            "{}",
            serde_json::to_string(&ExportMetadata::new("test", 0, Some(999))).unwrap()
        )
        .unwrap();
        for number in 0..1000u64 {
            let record = LedgerRecord {
                kind: LedgerRecordKind::Body,
                block_number: Some(number),
                block_hash: Some(H256::from_low_u64_be(number)),
                payload: vec![0xc0],
            };
            writeln!(
                out,
                "{}",
                serde_json::json!({"type": "block", "data": record})
            )
            .unwrap();
            if number == 500 {
                writeln!(out, "{{\"type\": \"block\", \"data\": {{\"kind\": ").unwrap();
            }
        }
        drop(out);

        let summary = import(import_job(&file), &InMemoryBackend::new()).await;
        assert_eq!(summary.imported, 1000);
        assert_eq!(summary.decode_errors, 1);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn store_to_store_commits_in_batches() {
        let source = InMemoryBackend::new();
        let codec = KeyCodec::default();
        let mut batch = source.begin_write().unwrap();
        for number in 0..250u64 {
            let key = codec
                .encode(LedgerRecordKind::Body, Some(number), Some(H256::from_low_u64_be(number)))
                .unwrap();
            batch.put(&key, &[0xc0]).unwrap();
        }
        batch.commit().unwrap();

        let destination = InMemoryBackend::new();
        let mut job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Store(location("dest")),
        );
        job.batch_size = 100;
        let summary = Orchestrator::new(job)
            .with_store("src", Arc::new(source))
            .with_store("dest", Arc::new(destination.clone()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.imported, 250);
        assert_eq!(summary.commits, 3);
        assert_eq!(destination.commit_sizes().unwrap(), vec![100, 100, 50]);
        assert!(summary.head.is_none());
    }

    #[tokio::test]
    async fn block_range_and_state_filter() {
        let source = source_chain(10);
        let destination = InMemoryBackend::new();
        let mut job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Store(location("dest")),
        );
        job.block_range = BlockRange {
            start: 2,
            end: Some(4),
        };
        job.include_state = false;
        let summary = Orchestrator::new(job)
            .with_store("src", Arc::new(source))
            .with_store("dest", Arc::new(destination.clone()))
            .run()
            .await
            .unwrap();

        // Five block-family records for each of blocks 2, 3 and 4.
        assert_eq!(summary.imported, 3 * 5);
        assert_eq!(summary.filtered, 10 * RECORDS_PER_BLOCK - 3 * 5);
        assert_eq!(summary.head.unwrap().last_block_number, 4);
        assert_eq!(count(&destination, LedgerRecordKind::AccountTrieNode), 0);
    }

    #[tokio::test]
    async fn dry_run_leaves_destination_untouched() {
        let destination = InMemoryBackend::new();
        let mut job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Store(location("dest")),
        );
        job.dry_run = true;
        let summary = Orchestrator::new(job)
            .with_store("src", Arc::new(source_chain(5)))
            .with_store("dest", Arc::new(destination.clone()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.imported, 5 * RECORDS_PER_BLOCK);
        assert!(summary.head.is_none());
        assert!(destination.is_empty().unwrap());
    }

    #[tokio::test]
    async fn cancelled_run_does_not_reconcile() {
        let destination = InMemoryBackend::new();
        let mut job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Store(location("dest")),
        );
        job.batch_size = 10;
        let orchestrator = Orchestrator::new(job)
            .with_store("src", Arc::new(source_chain(50)))
            .with_store("dest", Arc::new(destination.clone()));
        orchestrator.cancel_token().cancel();
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(summary.head.is_none());
        assert_eq!(summary.imported, 0);
        assert!(destination.is_empty().unwrap());
        assert!(
            !HeadReconciler::new(Arc::new(destination), KeyCodec::default(), None)
                .read_markers()
                .unwrap()
                .is_consistent()
        );
    }

    #[tokio::test]
    async fn deadline_cancels_until_the_run_ends() {
        let mut job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Store(location("dest")),
        );
        job.deadline = Some(Duration::from_millis(5));
        let orchestrator = Orchestrator::new(job);

        let guard = orchestrator.spawn_deadline();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.cancel_token().is_cancelled());
        drop(guard);

        let mut job = orchestrator.job().clone();
        job.deadline = Some(Duration::from_millis(20));
        let orchestrator = Orchestrator::new(job);
        drop(orchestrator.spawn_deadline());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!orchestrator.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn rpc_export_writes_every_fetched_block() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("rpc.jsonl");
        let mut job = MigrationJob::new(
            SourceDescriptor::Rpc {
                url: "mock://node".into(),
            },
            DestinationDescriptor::Transport {
                path: file.clone(),
                compression: Compression::None,
            },
        );
        job.worker_count = 7;
        let summary = Orchestrator::new(job)
            .with_rpc("mock://node", Arc::new(MockChain::with_blocks(0..=49)))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.imported, 50);
        assert_eq!(summary.lines_written, Some(51));
        let mut numbers: Vec<_> = TransportReader::open(&file)
            .unwrap()
            .map(|entry| entry.unwrap().block_number().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn transport_import_into_rpc_node() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("rpc.jsonl");
        let mut export_job = MigrationJob::new(
            SourceDescriptor::Rpc {
                url: "mock://source".into(),
            },
            DestinationDescriptor::Transport {
                path: file.clone(),
                compression: Compression::None,
            },
        );
        export_job.block_range = BlockRange {
            start: 0,
            end: Some(29),
        };
        Orchestrator::new(export_job)
            .with_rpc("mock://source", Arc::new(MockChain::with_blocks(0..=29)))
            .run()
            .await
            .unwrap();

        let destination = Arc::new(MockChain::with_blocks(0..=9));
        let job = MigrationJob::new(
            SourceDescriptor::Transport { path: file },
            DestinationDescriptor::Rpc {
                url: "mock://dest".into(),
                method: ImportMethod::default(),
            },
        );
        let summary = Orchestrator::new(job)
            .with_rpc("mock://dest", destination.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.skipped, 10);
        assert_eq!(summary.imported, 20);
        assert_eq!(summary.destination_height, Some(29));
        assert_eq!(destination.imported().len(), 20);
    }

    #[tokio::test]
    async fn deadline_stops_a_relay_with_a_slow_destination() {
        let mut job = MigrationJob::new(
            SourceDescriptor::Rpc {
                url: "mock://source".into(),
            },
            DestinationDescriptor::Rpc {
                url: "mock://dest".into(),
                method: ImportMethod::default(),
            },
        );
        job.worker_count = 4;
        job.deadline = Some(Duration::from_millis(300));
        let destination = Arc::new(MockChain::default().with_import_delay(Duration::from_millis(20)));
        let orchestrator = Orchestrator::new(job)
            .with_rpc("mock://source", Arc::new(MockChain::with_blocks(0..=20_000)))
            .with_rpc("mock://dest", destination.clone());

        let summary = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
            .await
            .expect("relay kept running after its deadline")
            .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(summary.imported < 20_001);
        assert_eq!(destination.imported().len() as u64, summary.imported);
    }

    #[tokio::test]
    async fn bucketed_destination_gets_a_verified_head() {
        let destination = InMemoryBackend::new();
        let namespace = H256::repeat_byte(0x42);
        let job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Store(StoreLocation {
                schema: SchemaVersion::Bucketed,
                namespace: Some(namespace),
                ..location("dest")
            }),
        );
        let summary = Orchestrator::new(job)
            .with_store("src", Arc::new(source_chain(5)))
            .with_store("dest", Arc::new(destination.clone()))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.errors, 0);
        assert_eq!(summary.imported, 5 * RECORDS_PER_BLOCK);
        assert_eq!(summary.head.unwrap().last_block_number, 4);
        let verification = summary.verification.unwrap();
        assert!(verification.is_clean(), "{verification:?}");

        let bucketed = KeyCodec::new(SchemaVersion::Bucketed).with_namespace(Some(namespace));
        let canonical = bucketed
            .encode(LedgerRecordKind::CanonicalHash, Some(4), None)
            .unwrap();
        assert!(destination.get(&canonical).unwrap().is_some());
    }

    #[tokio::test]
    async fn rpc_to_store_is_rejected() {
        let job = MigrationJob::new(
            SourceDescriptor::Rpc {
                url: "mock://node".into(),
            },
            DestinationDescriptor::Store(location("dest")),
        );
        let result = Orchestrator::new(job).run().await;
        assert!(matches!(result, Err(MigrationError::InvalidJob(_))));
    }

    #[tokio::test]
    async fn manual_head_overrides_written_head() {
        let temp_dir = TempDir::new().unwrap();
        let destination = InMemoryBackend::new();
        let mut job = MigrationJob::new(
            SourceDescriptor::Store(location("src")),
            DestinationDescriptor::Store(location("dest")),
        );
        let manual = ChainHeadPointer {
            last_block_number: 3,
            last_block_hash: crate::record::keccak256(b"header-3"),
        };
        job.head = HeadStrategy::Manual(manual);
        job.resume_dir = Some(temp_dir.path().to_path_buf());
        let summary = Orchestrator::new(job)
            .with_store("src", Arc::new(source_chain(8)))
            .with_store("dest", Arc::new(destination))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.head, Some(manual));
        assert_eq!(read_resume_metadata(temp_dir.path()).unwrap(), Some(manual));
    }
}
