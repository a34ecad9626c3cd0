use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::{Args, Parser as ClapParser, Subcommand as ClapSubcommand};
use ethereum_types::H256;
use eyre::{ContextCompat, Result, WrapErr, bail};
use ledger_migration::{
    BLOCKCHAIN_PREFIXES, ChainHeadPointer, Compression, DestinationDescriptor, HeadError,
    HeadReconciler, HeadStrategy, MigrationError, MigrationJob, MigrationSummary, Orchestrator,
    PrefixCopy, RunStatus, STATE_PREFIXES, SchemaVersion, SourceDescriptor, StoreLocation,
    VerificationReport, Verifier, copy_prefixes,
    copy::{CopyStats, DEFAULT_COPY_BATCH_SIZE},
    head::{HeadMarkers, head_from_rpc, head_from_store},
    job::BlockRange,
    parse_manual_head,
    rpc::{HttpRpcClient, RpcConfig, RpcError},
    writer::{ImportMethod, direct::DEFAULT_BATCH_SIZE, rpc::DEFAULT_IMPORT_METHOD},
};
use ledger_storage::{EngineType, InMemoryBackend, OpenMode, StorageBackend, open_backend};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};

const REPORT_SCHEMA_VERSION: u32 = 1;
const DEFAULT_RPC_RETRIES: u32 = 3;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
const MAX_BATCH_SIZE: u64 = 1_000_000;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "ledger-migrate",
    author = "LambdaClass",
    about = "Ledger data migration tools"
)]
pub struct CLI {
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "LEDGER_MIGRATE_LOG_LEVEL",
        global = true,
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error"
    )]
    pub log_level: Level,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ReportOptions {
    #[arg(long = "json", default_value_t = false, help_heading = "Report options")]
    /// Emit machine-readable JSON output
    pub json: bool,
    #[arg(
        long = "report-file",
        env = "LEDGER_MIGRATE_REPORT_FILE",
        help_heading = "Report options"
    )]
    /// Optional path to append emitted reports (JSON lines in --json mode)
    pub report_file: Option<PathBuf>,
    #[arg(
        long = "timeout-secs",
        env = "LEDGER_MIGRATE_TIMEOUT_SECS",
        value_parser = clap::value_parser!(u64).range(1..),
        help_heading = "Report options"
    )]
    /// Cancel the run at the next batch boundary after this many seconds
    pub timeout_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct SourceOptions {
    #[arg(
        long = "source.store",
        env = "LEDGER_MIGRATE_SOURCE_STORE",
        conflicts_with_all = ["source_file", "source_rpc"],
        help_heading = "Source options"
    )]
    /// Read from the store in this directory
    pub source_store: Option<PathBuf>,
    #[arg(long = "source.file", conflicts_with = "source_rpc", help_heading = "Source options")]
    /// Read from a transport file (`.gz` is decompressed)
    pub source_file: Option<PathBuf>,
    #[arg(long = "source.rpc", env = "LEDGER_MIGRATE_SOURCE_RPC", help_heading = "Source options")]
    /// Fetch blocks from a node's JSON-RPC endpoint
    pub source_rpc: Option<String>,
    #[arg(long = "source.engine", default_value = "rocksdb", help_heading = "Source options")]
    /// Storage engine of the source store (rocksdb, memory)
    pub source_engine: EngineType,
    #[arg(long = "source.schema", default_value = "rawdb", help_heading = "Source options")]
    /// Key schema of the source store (rawdb, namespaced, bucketed)
    pub source_schema: SchemaVersion,
    #[arg(long = "source.namespace", value_parser = parse_namespace, help_heading = "Source options")]
    /// 32-byte chain namespace, required by the namespaced schema
    pub source_namespace: Option<H256>,
}

impl SourceOptions {
    fn descriptor(&self) -> Result<SourceDescriptor> {
        match (&self.source_store, &self.source_file, &self.source_rpc) {
            (Some(path), None, None) => Ok(SourceDescriptor::Store(StoreLocation {
                path: path.clone(),
                engine: self.source_engine,
                schema: self.source_schema,
                namespace: self.source_namespace,
            })),
            (None, Some(path), None) => Ok(SourceDescriptor::Transport { path: path.clone() }),
            (None, None, Some(url)) => Ok(SourceDescriptor::Rpc { url: url.clone() }),
            _ => bail!("Exactly one of --source.store, --source.file or --source.rpc is required"),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DestinationOptions {
    #[arg(
        long = "dest.store",
        env = "LEDGER_MIGRATE_DEST_STORE",
        conflicts_with_all = ["dest_file", "dest_rpc"],
        help_heading = "Destination options"
    )]
    /// Write into the store in this directory, creating it if needed
    pub dest_store: Option<PathBuf>,
    #[arg(long = "dest.file", conflicts_with = "dest_rpc", help_heading = "Destination options")]
    /// Write a transport file (gzip when the name ends in `.gz`)
    pub dest_file: Option<PathBuf>,
    #[arg(long = "dest.rpc", env = "LEDGER_MIGRATE_DEST_RPC", help_heading = "Destination options")]
    /// Submit blocks to a node's JSON-RPC endpoint
    pub dest_rpc: Option<String>,
    #[arg(long = "dest.engine", default_value = "rocksdb", help_heading = "Destination options")]
    /// Storage engine of the destination store (rocksdb, memory)
    pub dest_engine: EngineType,
    #[arg(long = "dest.schema", default_value = "rawdb", help_heading = "Destination options")]
    /// Key schema of the destination store (rawdb, namespaced, bucketed)
    pub dest_schema: SchemaVersion,
    #[arg(long = "dest.namespace", value_parser = parse_namespace, help_heading = "Destination options")]
    /// 32-byte chain namespace, required by the namespaced schema
    pub dest_namespace: Option<H256>,
    #[arg(
        long = "dest.method",
        default_value = DEFAULT_IMPORT_METHOD,
        help_heading = "Destination options"
    )]
    /// Bulk import method called with `[[block]]` on an RPC destination
    pub dest_method: String,
    #[arg(long = "dest.raw-transactions", default_value_t = false, help_heading = "Destination options")]
    /// Replay each block's raw transactions through eth_sendRawTransaction instead
    pub dest_raw_transactions: bool,
}

impl DestinationOptions {
    fn descriptor(&self) -> Result<DestinationDescriptor> {
        match (&self.dest_store, &self.dest_file, &self.dest_rpc) {
            (Some(path), None, None) => Ok(DestinationDescriptor::Store(StoreLocation {
                path: path.clone(),
                engine: self.dest_engine,
                schema: self.dest_schema,
                namespace: self.dest_namespace,
            })),
            (None, Some(path), None) => Ok(DestinationDescriptor::Transport {
                path: path.clone(),
                compression: Compression::from_path_hint(path),
            }),
            (None, None, Some(url)) => Ok(DestinationDescriptor::Rpc {
                url: url.clone(),
                method: if self.dest_raw_transactions {
                    ImportMethod::RawTransactions
                } else {
                    ImportMethod::Bulk {
                        method: self.dest_method.clone(),
                    }
                },
            }),
            _ => bail!("Exactly one of --dest.store, --dest.file or --dest.rpc is required"),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunOptions {
    #[arg(long = "from-block", default_value_t = 0, help_heading = "Run options")]
    /// First block to migrate
    pub from_block: u64,
    #[arg(long = "to-block", help_heading = "Run options")]
    /// Last block to migrate (inclusive); defaults to the source head
    pub to_block: Option<u64>,
    #[arg(
        long = "batch-size",
        default_value_t = DEFAULT_BATCH_SIZE as u64,
        value_parser = clap::value_parser!(u64).range(1..=MAX_BATCH_SIZE),
        env = "LEDGER_MIGRATE_BATCH_SIZE",
        help_heading = "Run options"
    )]
    /// Records per destination commit (1-1000000)
    pub batch_size: u64,
    #[arg(
        long = "workers",
        value_parser = clap::value_parser!(u64).range(1..=200),
        env = "LEDGER_MIGRATE_WORKERS",
        help_heading = "Run options"
    )]
    /// Concurrent RPC workers (1-200, imports capped at 50) [default: available cores]
    pub workers: Option<u64>,
    #[arg(long = "dry-run", default_value_t = false, help_heading = "Run options")]
    /// Read and count everything without writing to the destination
    pub dry_run: bool,
    #[arg(
        long = "skip-existing",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Run options"
    )]
    /// Skip records the destination already has
    pub skip_existing: bool,
    #[arg(long = "no-state", default_value_t = false, help_heading = "Run options")]
    /// Leave trie nodes out of the migration
    pub no_state: bool,
    #[arg(long = "no-verify", default_value_t = false, help_heading = "Run options")]
    /// Skip the sampled verification after the run
    pub no_verify: bool,
    #[arg(long = "resume-dir", help_heading = "Run options")]
    /// Directory receiving `vm/` resume metadata; defaults to the destination's parent
    pub resume_dir: Option<PathBuf>,
    #[arg(
        long = "rpc.timeout-secs",
        default_value_t = DEFAULT_RPC_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..=600),
        help_heading = "RPC options"
    )]
    /// Per-request timeout in seconds (1-600)
    pub rpc_timeout_secs: u64,
    #[arg(
        long = "rpc.retries",
        default_value_t = DEFAULT_RPC_RETRIES,
        value_parser = clap::value_parser!(u32).range(0..=10),
        help_heading = "RPC options"
    )]
    /// Retry budget for retryable RPC failures (0-10, inclusive)
    pub rpc_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadMode {
    Written,
    Source,
    Rpc,
    Manual,
    Skip,
}

fn parse_head_mode(s: &str) -> Result<HeadMode, String> {
    match s {
        "written" => Ok(HeadMode::Written),
        "source" => Ok(HeadMode::Source),
        "rpc" => Ok(HeadMode::Rpc),
        "manual" => Ok(HeadMode::Manual),
        "skip" => Ok(HeadMode::Skip),
        other => Err(format!(
            "unknown head mode `{other}` (expected written, source, rpc, manual or skip)"
        )),
    }
}

fn parse_namespace(s: &str) -> Result<H256, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|e| format!("invalid namespace hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("namespace must be 32 bytes, got {}", bytes.len()));
    }
    Ok(H256::from_slice(&bytes))
}

#[derive(Args, Debug, Clone)]
pub struct HeadOptions {
    #[arg(
        long = "head",
        default_value = "written",
        value_parser = parse_head_mode,
        help_heading = "Head options",
        long_help = "Possible values: written, source, rpc, manual, skip"
    )]
    /// How the destination head is chosen after the run
    pub mode: HeadMode,
    #[arg(long = "head.number", help_heading = "Head options")]
    /// Head block number for `--head manual`
    pub number: Option<u64>,
    #[arg(long = "head.hash", help_heading = "Head options")]
    /// Head block hash for `--head manual`, with or without 0x
    pub hash: Option<String>,
    #[arg(long = "head.rpc", help_heading = "Head options")]
    /// Node whose current head is used with `--head rpc`
    pub rpc: Option<String>,
}

impl HeadOptions {
    fn strategy(&self) -> Result<HeadStrategy> {
        Ok(match self.mode {
            HeadMode::Written => HeadStrategy::Written,
            HeadMode::Source => HeadStrategy::FromSource,
            HeadMode::Skip => HeadStrategy::Skip,
            HeadMode::Rpc => HeadStrategy::FromRpc(
                self.rpc
                    .clone()
                    .wrap_err("--head rpc needs --head.rpc")?,
            ),
            HeadMode::Manual => HeadStrategy::Manual(self.manual_head()?),
        })
    }

    fn manual_head(&self) -> Result<ChainHeadPointer> {
        let number = self.number.wrap_err("--head manual needs --head.number")?;
        let hash = self.hash.as_deref().wrap_err("--head manual needs --head.hash")?;
        Ok(parse_manual_head(number, hash)?)
    }
}

#[derive(Args, Debug, Clone)]
pub struct StoreOptions {
    #[arg(long = "store", env = "LEDGER_MIGRATE_STORE", help_heading = "Store options")]
    /// Store directory
    pub store: PathBuf,
    #[arg(long = "engine", default_value = "rocksdb", help_heading = "Store options")]
    /// Storage engine (rocksdb, memory)
    pub engine: EngineType,
    #[arg(long = "schema", default_value = "rawdb", help_heading = "Store options")]
    /// Key schema (rawdb, namespaced, bucketed)
    pub schema: SchemaVersion,
    #[arg(long = "namespace", value_parser = parse_namespace, help_heading = "Store options")]
    /// 32-byte chain namespace, required by the namespaced schema
    pub namespace: Option<H256>,
}

impl StoreOptions {
    fn location(&self) -> Result<StoreLocation> {
        if self.schema.is_namespaced() && self.namespace.is_none() {
            bail!("Schema {} needs --namespace", self.schema);
        }
        Ok(StoreLocation {
            path: self.store.clone(),
            engine: self.engine,
            schema: self.schema,
            namespace: self.namespace,
        })
    }
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(
        name = "export",
        visible_alias = "e",
        about = "Export a store or a node's blocks to a transport file"
    )]
    Export {
        #[command(flatten)]
        source: SourceOptions,
        #[arg(long = "output", env = "LEDGER_MIGRATE_OUTPUT")]
        /// Transport file to write
        output: PathBuf,
        #[arg(long = "compress", default_value_t = false)]
        /// Gzip the output, appending `.gz` to the file name when missing
        compress: bool,
        #[command(flatten)]
        run: RunOptions,
        #[command(flatten)]
        report: ReportOptions,
    },
    #[command(
        name = "import",
        visible_alias = "i",
        about = "Import a transport file into a store or a node"
    )]
    Import {
        #[arg(long = "input", env = "LEDGER_MIGRATE_INPUT")]
        /// Transport file to read (`.gz` is decompressed)
        input: PathBuf,
        #[command(flatten)]
        destination: DestinationOptions,
        #[command(flatten)]
        head: HeadOptions,
        #[command(flatten)]
        run: RunOptions,
        #[command(flatten)]
        report: ReportOptions,
    },
    #[command(
        name = "migrate",
        visible_alias = "m",
        about = "Migrate directly between stores and nodes without an intermediate file"
    )]
    Migrate {
        #[command(flatten)]
        source: SourceOptions,
        #[command(flatten)]
        destination: DestinationOptions,
        #[command(flatten)]
        head: HeadOptions,
        #[command(flatten)]
        run: RunOptions,
        #[command(flatten)]
        report: ReportOptions,
    },
    #[command(name = "set-head", about = "Point a store's head markers at a block")]
    SetHead {
        #[command(flatten)]
        store: StoreOptions,
        #[command(flatten)]
        head: HeadOptions,
        #[arg(long = "head.source", help_heading = "Head options")]
        /// Store whose head markers are copied with `--head source`
        source: Option<PathBuf>,
        #[arg(long = "resume-dir")]
        /// Directory receiving `vm/` resume metadata; defaults to the store's parent
        resume_dir: Option<PathBuf>,
        #[command(flatten)]
        report: ReportOptions,
    },
    #[command(name = "verify", about = "Spot-check a store's canonical chain and head markers")]
    Verify {
        #[command(flatten)]
        store: StoreOptions,
        #[arg(long = "last-block")]
        /// Highest block expected in the store; defaults to the store's head
        last_block: Option<u64>,
        #[command(flatten)]
        report: ReportOptions,
    },
    #[command(
        name = "copy-prefix",
        about = "Copy raw key ranges between two stores without decoding them"
    )]
    CopyPrefix {
        #[arg(long = "source.store")]
        /// Store to copy from
        source: PathBuf,
        #[arg(long = "source.engine", default_value = "rocksdb")]
        /// Storage engine of the source store (rocksdb, memory)
        source_engine: EngineType,
        #[arg(long = "dest.store")]
        /// Store to copy into, created if needed
        destination: PathBuf,
        #[arg(long = "dest.engine", default_value = "rocksdb")]
        /// Storage engine of the destination store (rocksdb, memory)
        dest_engine: EngineType,
        #[arg(long = "prefix", value_delimiter = ',')]
        /// Hex key prefixes to copy
        prefixes: Vec<String>,
        #[arg(long = "blockchain", default_value_t = false)]
        /// Copy chain data (bodies, receipts, headers, indices)
        blockchain: bool,
        #[arg(long = "state", default_value_t = false)]
        /// Copy state data (accounts, storage, code)
        state: bool,
        #[arg(
            long = "batch-size",
            default_value_t = DEFAULT_COPY_BATCH_SIZE as u64,
            value_parser = clap::value_parser!(u64).range(1..=MAX_BATCH_SIZE)
        )]
        /// Entries per destination commit (1-1000000)
        batch_size: u64,
        #[arg(long = "skip-existing", default_value_t = false)]
        /// Skip keys the destination already has
        skip_existing: bool,
        #[arg(long = "dry-run", default_value_t = false)]
        /// Count what would be copied without writing
        dry_run: bool,
        #[command(flatten)]
        report: ReportOptions,
    },
}

impl Subcommand {
    pub fn report_options(&self) -> &ReportOptions {
        match self {
            Self::Export { report, .. }
            | Self::Import { report, .. }
            | Self::Migrate { report, .. }
            | Self::SetHead { report, .. }
            | Self::Verify { report, .. }
            | Self::CopyPrefix { report, .. } => report,
        }
    }

    pub fn json_output(&self) -> bool {
        self.report_options().json
    }

    pub fn report_file(&self) -> Option<&Path> {
        self.report_options().report_file.as_deref()
    }

    pub fn retry_attempts(&self) -> u32 {
        match self {
            Self::Export { run, .. } | Self::Import { run, .. } | Self::Migrate { run, .. } => {
                run.rpc_retries
            }
            Self::SetHead { .. } => DEFAULT_RPC_RETRIES,
            Self::Verify { .. } | Self::CopyPrefix { .. } => 0,
        }
    }

    pub async fn run(&self) -> Result<()> {
        match self {
            Self::Export {
                source,
                output,
                compress,
                run,
                report,
            } => {
                let path = export_path(output, *compress);
                let destination = DestinationDescriptor::Transport {
                    compression: Compression::from_path_hint(&path),
                    path,
                };
                let job = build_job(source.descriptor()?, destination, run, None, report)?;
                run_job(job, report).await
            }
            Self::Import {
                input,
                destination,
                head,
                run,
                report,
            } => {
                let source = SourceDescriptor::Transport {
                    path: input.clone(),
                };
                let job = build_job(source, destination.descriptor()?, run, Some(head), report)?;
                run_job(job, report).await
            }
            Self::Migrate {
                source,
                destination,
                head,
                run,
                report,
            } => {
                let job = build_job(
                    source.descriptor()?,
                    destination.descriptor()?,
                    run,
                    Some(head),
                    report,
                )?;
                run_job(job, report).await
            }
            Self::SetHead {
                store,
                head,
                source,
                resume_dir,
                report,
            } => set_head(store, head, source.as_deref(), resume_dir.clone(), report).await,
            Self::Verify {
                store,
                last_block,
                report,
            } => verify_store(store, *last_block, report),
            Self::CopyPrefix {
                source,
                source_engine,
                destination,
                dest_engine,
                prefixes,
                blockchain,
                state,
                batch_size,
                skip_existing,
                dry_run,
                report,
            } => {
                let mut options = PrefixCopy::new(collect_prefixes(prefixes, *blockchain, *state)?);
                options.batch_size = *batch_size as usize;
                options.skip_existing = *skip_existing;
                options.dry_run = *dry_run;
                copy_stores(
                    (source, *source_engine),
                    (destination, *dest_engine),
                    options,
                    report,
                )
                .await
            }
        }
    }
}

/// Appends `.gz` when compression is requested and the name lacks it.
fn export_path(output: &Path, compress: bool) -> PathBuf {
    if !compress || Compression::from_path_hint(output) == Compression::Gzip {
        return output.to_path_buf();
    }
    let mut name = output.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

fn default_resume_dir(path: &Path) -> Option<PathBuf> {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

fn build_job(
    source: SourceDescriptor,
    destination: DestinationDescriptor,
    run: &RunOptions,
    head: Option<&HeadOptions>,
    report: &ReportOptions,
) -> Result<MigrationJob> {
    let mut job = MigrationJob::new(source, destination);
    job.block_range = BlockRange {
        start: run.from_block,
        end: run.to_block,
    };
    job.batch_size = run.batch_size as usize;
    if let Some(workers) = run.workers {
        job.worker_count = workers as usize;
    }
    job.dry_run = run.dry_run;
    job.skip_existing = run.skip_existing;
    job.include_state = !run.no_state;
    job.verify = !run.no_verify;
    job.deadline = report.timeout_secs.map(Duration::from_secs);
    job.rpc = RpcConfig {
        timeout: Duration::from_secs(run.rpc_timeout_secs),
        max_retries: run.rpc_retries,
        ..RpcConfig::default()
    };
    if let Some(head) = head {
        job.head = head.strategy()?;
    }
    job.resume_dir = run.resume_dir.clone().or_else(|| {
        job.destination_store()
            .and_then(|location| default_resume_dir(&location.path))
    });
    job.validate()?;
    Ok(job)
}

/// Cancels `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    warn!("Interrupt received, stopping at the next batch boundary");
                    cancel.cancel();
                }
            }
            _ = cancel.cancelled() => {}
        }
    });
}

async fn run_job(job: MigrationJob, report: &ReportOptions) -> Result<()> {
    let orchestrator = Orchestrator::new(job);
    cancel_on_ctrl_c(orchestrator.cancel_token());
    let summary = orchestrator.run().await?;
    emit_report("migration", &summary, &summary_lines(&summary), report)
}

fn summary_lines(summary: &MigrationSummary) -> Vec<String> {
    let status = match summary.status {
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
    };
    let mut lines = vec![format!(
        "Migration {status} in {}ms: {} imported, {} skipped, {} error(s), {} malformed line(s) ({:.0} records/s).",
        summary.elapsed_ms,
        summary.imported,
        summary.skipped,
        summary.errors,
        summary.decode_errors,
        summary.throughput
    )];
    if summary.unclassified + summary.foreign_namespace + summary.ignored > 0 {
        lines.push(format!(
            "Left out {} unclassified key(s), {} foreign-namespace key(s) and {} unknown line(s).",
            summary.unclassified, summary.foreign_namespace, summary.ignored
        ));
    }
    if summary.dry_run {
        lines.push("Dry-run complete: no data was written.".to_string());
    }
    if let Some(head) = summary.head {
        lines.push(format!(
            "Head set to #{} ({:#x}).",
            head.last_block_number, head.last_block_hash
        ));
    }
    if let Some(verification) = &summary.verification {
        lines.push(verification_line(verification));
    }
    if let Some(height) = summary.destination_height {
        lines.push(format!("Destination height after import: #{height}."));
    }
    lines
}

fn verification_line(verification: &VerificationReport) -> String {
    format!(
        "Verification: {}/{} sampled block(s) found, {} warning(s).",
        verification.found,
        verification.checked,
        verification.warnings.len()
    )
}

#[derive(Serialize)]
struct SetHeadReport {
    status: &'static str,
    head: ChainHeadPointer,
    markers: HeadMarkers,
    resume_dir: Option<PathBuf>,
    elapsed_ms: u64,
}

async fn set_head(
    store: &StoreOptions,
    head: &HeadOptions,
    source: Option<&Path>,
    resume_dir: Option<PathBuf>,
    report: &ReportOptions,
) -> Result<()> {
    let started_at = Instant::now();
    let location = store.location()?;
    let codec = location.codec();

    let target = match head.mode {
        HeadMode::Manual => head.manual_head()?,
        HeadMode::Source => {
            let source = source.wrap_err("--head source needs --head.source")?;
            let backend = open_backend(source, location.engine, OpenMode::ReadOnly)
                .wrap_err_with(|| format!("Cannot open source store {source:?}"))?;
            head_from_store(backend.as_ref(), &codec)?
        }
        HeadMode::Rpc => {
            let url = head.rpc.as_deref().wrap_err("--head rpc needs --head.rpc")?;
            head_from_rpc(&HttpRpcClient::new(url)).await?
        }
        HeadMode::Written | HeadMode::Skip => {
            bail!("set-head needs --head manual, source or rpc")
        }
    };

    let backend = open_backend(&location.path, location.engine, OpenMode::ReadWrite)
        .wrap_err_with(|| format!("Cannot open store {:?}", location.path))?;
    let resume_dir = resume_dir.or_else(|| default_resume_dir(&location.path));
    let reconciler = HeadReconciler::new(backend, codec, resume_dir.clone());
    reconciler.reconcile(target)?;

    let outcome = SetHeadReport {
        status: "completed",
        head: target,
        markers: reconciler.read_markers()?,
        resume_dir,
        elapsed_ms: elapsed_ms(started_at),
    };
    let lines = vec![format!(
        "Head set to #{} ({:#x}).",
        target.last_block_number, target.last_block_hash
    )];
    emit_report("set_head", &outcome, &lines, report)
}

#[derive(Serialize)]
struct VerifyReport {
    status: &'static str,
    last_block: u64,
    verification: VerificationReport,
    elapsed_ms: u64,
}

fn verify_store(store: &StoreOptions, last_block: Option<u64>, report: &ReportOptions) -> Result<()> {
    let started_at = Instant::now();
    let location = store.location()?;
    let codec = location.codec();
    let backend = open_backend(&location.path, location.engine, OpenMode::ReadOnly)
        .wrap_err_with(|| format!("Cannot open store {:?}", location.path))?;

    let last_block = match last_block {
        Some(last) => last,
        None => {
            head_from_store(backend.as_ref(), &codec)
                .wrap_err("Cannot read the store head, pass --last-block")?
                .last_block_number
        }
    };
    let verification = Verifier::new(backend.as_ref(), &codec).verify(last_block);
    let lines = std::iter::once(verification_line(&verification))
        .chain(verification.warnings.iter().map(|w| format!("  {w}")))
        .collect::<Vec<_>>();
    let outcome = VerifyReport {
        status: if verification.is_clean() {
            "completed"
        } else {
            "warnings"
        },
        last_block,
        verification,
        elapsed_ms: elapsed_ms(started_at),
    };
    emit_report("verification", &outcome, &lines, report)
}

fn collect_prefixes(hex_prefixes: &[String], blockchain: bool, state: bool) -> Result<Vec<Vec<u8>>> {
    let mut prefixes = hex_prefixes
        .iter()
        .map(|prefix| {
            hex::decode(prefix.strip_prefix("0x").unwrap_or(prefix))
                .wrap_err_with(|| format!("Invalid hex prefix `{prefix}`"))
        })
        .collect::<Result<Vec<_>>>()?;
    if blockchain {
        prefixes.extend(BLOCKCHAIN_PREFIXES.iter().map(|tag| vec![*tag]));
    }
    if state {
        prefixes.extend(STATE_PREFIXES.iter().map(|tag| vec![*tag]));
    }
    if prefixes.is_empty() {
        bail!("Nothing to copy: pass --prefix, --blockchain or --state");
    }
    Ok(prefixes)
}

#[derive(Serialize)]
struct CopyReport {
    status: &'static str,
    #[serde(flatten)]
    stats: CopyStats,
    elapsed_ms: u64,
}

async fn copy_stores(
    (source, source_engine): (&Path, EngineType),
    (destination, dest_engine): (&Path, EngineType),
    options: PrefixCopy,
    report: &ReportOptions,
) -> Result<()> {
    let started_at = Instant::now();
    if source == destination {
        bail!("Source and destination are the same store");
    }
    let source_backend = open_backend(source, source_engine, OpenMode::ReadOnly)
        .wrap_err_with(|| format!("Cannot open source store {source:?}"))?;
    let dest_backend: Arc<dyn StorageBackend> = if options.dry_run && !destination.exists() {
        Arc::new(InMemoryBackend::new())
    } else {
        let mode = if options.dry_run {
            OpenMode::ReadOnly
        } else {
            OpenMode::ReadWrite
        };
        open_backend(destination, dest_engine, mode)
            .wrap_err_with(|| format!("Cannot open destination store {destination:?}"))?
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    if let Some(secs) = report.timeout_secs {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "Deadline reached, cancelling copy");
            cancel.cancel();
        });
    }

    info!(prefixes = options.prefixes.len(), "Starting prefix copy");
    let task_cancel = cancel.clone();
    let stats = tokio::task::spawn_blocking(move || {
        copy_prefixes(
            source_backend.as_ref(),
            dest_backend.as_ref(),
            &options,
            &task_cancel,
        )
    })
    .await
    .wrap_err("Copy task panicked")??;
    // Stops the interrupt and deadline tasks.
    cancel.cancel();

    let outcome = CopyReport {
        status: if stats.cancelled {
            "cancelled"
        } else {
            "completed"
        },
        stats,
        elapsed_ms: elapsed_ms(started_at),
    };
    let lines = vec![format!(
        "Copy {} in {}ms: {} scanned, {} copied, {} skipped, {} error(s) over {} commit(s).",
        outcome.status,
        outcome.elapsed_ms,
        stats.scanned,
        stats.copied,
        stats.skipped,
        stats.errors,
        stats.commits
    )];
    emit_report("copy", &outcome, &lines, report)
}

#[derive(Serialize)]
struct Report<'a, T: Serialize> {
    schema_version: u32,
    phase: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

fn emit_report<T: Serialize>(
    phase: &'static str,
    body: &T,
    human_lines: &[String],
    options: &ReportOptions,
) -> Result<()> {
    let report_file = options.report_file.as_deref();
    if options.json {
        let report = Report {
            schema_version: REPORT_SCHEMA_VERSION,
            phase,
            body,
        };
        let encoded = serde_json::to_string(&report).wrap_err("Cannot serialize report")?;
        println!("{encoded}");
        append_report_line(report_file, &encoded)?;
        return Ok(());
    }

    for line in human_lines {
        println!("{line}");
        append_report_line(report_file, line)?;
    }
    Ok(())
}

fn append_report_line(report_file: Option<&Path>, line: &str) -> Result<()> {
    let Some(path) = report_file else {
        return Ok(());
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Cannot create report directory {parent:?}"))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("Cannot open report file {path:?}"))?;
    writeln!(file, "{line}").wrap_err_with(|| format!("Cannot write report file {path:?}"))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Transient,
    Fatal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }

    fn retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

fn classify_error_from_message(message: &str) -> (ErrorKind, &'static str) {
    let msg = message.to_ascii_lowercase();
    let transient_markers = ["eagain", "etimedout", "timed out", "enospc", "temporar"];
    if transient_markers.iter().any(|marker| msg.contains(marker)) {
        return (ErrorKind::Transient, "message_marker");
    }

    (ErrorKind::Fatal, "default_fatal")
}

fn classify_io_error_kind(kind: std::io::ErrorKind) -> ErrorKind {
    use std::io::ErrorKind as IoErrorKind;

    match kind {
        IoErrorKind::WouldBlock
        | IoErrorKind::TimedOut
        | IoErrorKind::Interrupted
        | IoErrorKind::OutOfMemory
        | IoErrorKind::ConnectionReset
        | IoErrorKind::ConnectionAborted
        | IoErrorKind::NotConnected
        | IoErrorKind::BrokenPipe => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

fn classify_rpc_error(error: &RpcError) -> ErrorKind {
    if error.is_transient() {
        ErrorKind::Transient
    } else {
        ErrorKind::Fatal
    }
}

/// RPC error at the root of `error`, if any.
fn rpc_error(error: &eyre::Report) -> Option<&RpcError> {
    if let Some(rpc) = error.downcast_ref::<RpcError>() {
        return Some(rpc);
    }
    match error.downcast_ref::<MigrationError>() {
        Some(MigrationError::Rpc(rpc)) => return Some(rpc),
        Some(MigrationError::Head(HeadError::Rpc(rpc))) => return Some(rpc),
        _ => {}
    }
    match error.downcast_ref::<HeadError>() {
        Some(HeadError::Rpc(rpc)) => Some(rpc),
        _ => None,
    }
}

fn classify_error_from_report(error: &eyre::Report) -> (ErrorKind, &'static str) {
    if let Some(rpc) = rpc_error(error) {
        return (classify_rpc_error(rpc), "rpc");
    }

    match error.downcast_ref::<MigrationError>() {
        Some(MigrationError::TransportIo { source, .. }) => {
            return (classify_io_error_kind(source.kind()), "io_kind");
        }
        Some(MigrationError::FatalOpen { .. }) => return (ErrorKind::Fatal, "store_open"),
        Some(MigrationError::InvalidJob(_)) => return (ErrorKind::Fatal, "invalid_job"),
        _ => {}
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        return (classify_io_error_kind(io_error.kind()), "io_kind");
    }

    classify_error_from_message(&format!("{error:#}"))
}

#[derive(Serialize)]
struct MigrationErrorReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    error_type: &'static str,
    error_classification: &'static str,
    retryable: bool,
    retry_attempts: u32,
    retry_attempts_used: Option<u32>,
    error: String,
    elapsed_ms: u64,
}

fn elapsed_ms(started_at: Instant) -> u64 {
    started_at.elapsed().as_millis() as u64
}

fn build_migration_error_report(
    error: &eyre::Report,
    started_at: Instant,
    retry_attempts: u32,
) -> MigrationErrorReport {
    let (error_kind, error_classification) = classify_error_from_report(error);
    let retry_attempts_used = match rpc_error(error) {
        Some(RpcError::GaveUp { attempts, .. }) => Some(*attempts),
        _ => None,
    };

    MigrationErrorReport {
        schema_version: REPORT_SCHEMA_VERSION,
        status: "failed",
        phase: "execution",
        error_type: error_kind.as_str(),
        error_classification,
        retryable: error_kind.retryable(),
        retry_attempts,
        retry_attempts_used,
        error: format!("{error:#}"),
        elapsed_ms: elapsed_ms(started_at),
    }
}

pub fn emit_error_report(
    json: bool,
    retry_attempts: u32,
    started_at: Instant,
    error: &eyre::Report,
    report_file: Option<&Path>,
) {
    if json {
        let report = build_migration_error_report(error, started_at, retry_attempts);

        match serde_json::to_string(&report) {
            Ok(encoded) => {
                println!("{encoded}");
                if let Err(write_error) = append_report_line(report_file, &encoded) {
                    eprintln!(
                        "Migration failed: {error:#}\nCannot write report file: {write_error:#}"
                    );
                }
            }
            Err(ser_error) => {
                eprintln!("Migration failed: {error:#}\nReport encoding failed: {ser_error}")
            }
        }
        return;
    }

    let line = format!(
        "Migration failed after {}ms: {error:#}",
        elapsed_ms(started_at)
    );
    eprintln!("{line}");
    if let Err(write_error) = append_report_line(report_file, &line) {
        eprintln!("Cannot write report file: {write_error:#}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        time::{Instant, SystemTime, UNIX_EPOCH},
    };

    use super::*;
    use clap::Parser;
    use serde_json::Value;

    fn unique_test_path(suffix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("ledger-migrate-cli-unit-{suffix}-{nanos}"))
    }

    fn summary() -> MigrationSummary {
        MigrationSummary {
            status: RunStatus::Completed,
            source: "file:/tmp/chain.jsonl".to_string(),
            destination: "store:rawdb:/tmp/dest".to_string(),
            dry_run: false,
            imported: 8,
            skipped: 2,
            errors: 0,
            decode_errors: 1,
            unclassified: 0,
            foreign_namespace: 0,
            ignored: 0,
            filtered: 0,
            commits: 1,
            lines_written: None,
            head: Some(ChainHeadPointer {
                last_block_number: 20,
                last_block_hash: H256::repeat_byte(0xaa),
            }),
            verification: None,
            destination_height: None,
            elapsed_ms: 10,
            throughput: 800.0,
        }
    }

    #[test]
    fn emit_report_writes_json_line_to_report_file() {
        let report_path = unique_test_path("json-report").join("report.jsonl");
        let options = ReportOptions {
            json: true,
            report_file: Some(report_path.clone()),
            timeout_secs: None,
        };
        let summary = summary();

        emit_report("migration", &summary, &summary_lines(&summary), &options)
            .expect("json report emission should succeed");

        let file_content =
            fs::read_to_string(&report_path).expect("report file should be readable");
        let lines: Vec<&str> = file_content.lines().collect();
        assert_eq!(lines.len(), 1, "json mode should append exactly one line");
        let parsed: Value = serde_json::from_str(lines[0]).expect("line should be valid json");
        assert_eq!(parsed["schema_version"], 1);
        assert_eq!(parsed["phase"], "migration");
        assert_eq!(parsed["status"], "completed");
        assert_eq!(parsed["imported"], 8);
        assert_eq!(parsed["head"]["last_block_number"], 20);

        if let Some(parent) = report_path.parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn emit_report_writes_human_lines_to_report_file() {
        let report_path = unique_test_path("human-report").join("report.log");
        let options = ReportOptions {
            json: false,
            report_file: Some(report_path.clone()),
            timeout_secs: None,
        };
        let summary = MigrationSummary {
            dry_run: true,
            ..summary()
        };

        emit_report("migration", &summary, &summary_lines(&summary), &options)
            .expect("human report emission should succeed");

        let file_content =
            fs::read_to_string(&report_path).expect("report file should be readable");
        assert!(file_content.contains("Migration completed in 10ms: 8 imported, 2 skipped"));
        assert!(file_content.contains("Dry-run complete: no data was written."));
        assert!(file_content.contains("Head set to #20"));

        if let Some(parent) = report_path.parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn emit_error_report_writes_json_line_to_report_file() {
        let report_path = unique_test_path("json-error-report").join("error.jsonl");
        let error = eyre::eyre!("temporary EAGAIN failure");

        emit_error_report(
            true,
            DEFAULT_RPC_RETRIES,
            Instant::now(),
            &error,
            Some(&report_path),
        );

        let file_content =
            fs::read_to_string(&report_path).expect("report file should be readable");
        let line = file_content
            .lines()
            .next()
            .expect("report file should contain one line");
        let parsed: Value = serde_json::from_str(line).expect("line should be valid json");
        assert_eq!(parsed["status"], "failed");
        assert_eq!(parsed["retryable"], true);
        assert_eq!(parsed["retry_attempts"], 3);

        if let Some(parent) = report_path.parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn rpc_errors_are_classified_through_migration_errors() {
        let exhausted = RpcError::GaveUp {
            method: "eth_blockNumber".to_string(),
            attempts: 4,
            last: Box::new(RpcError::Timeout {
                method: "eth_blockNumber".to_string(),
                timeout_ms: 30_000,
            }),
        };
        let error = eyre::Report::new(MigrationError::Rpc(exhausted));

        let report = build_migration_error_report(&error, Instant::now(), 3);
        assert_eq!(report.error_type, "transient");
        assert_eq!(report.error_classification, "rpc");
        assert_eq!(report.retry_attempts_used, Some(4));

        let invalid = eyre::Report::new(MigrationError::InvalidJob("bad range".to_string()));
        let (kind, classification) = classify_error_from_report(&invalid);
        assert_eq!(kind, ErrorKind::Fatal);
        assert_eq!(classification, "invalid_job");
    }

    #[test]
    fn io_kinds_split_transient_and_fatal() {
        assert_eq!(
            classify_io_error_kind(std::io::ErrorKind::TimedOut),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_io_error_kind(std::io::ErrorKind::NotFound),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn append_report_line_creates_parent_dirs_and_appends() {
        let root = unique_test_path("append-lines");
        let report_path = root.join("nested/reports/output.log");

        append_report_line(Some(&report_path), "first line").expect("first write should succeed");
        append_report_line(Some(&report_path), "second line").expect("second write should succeed");

        let file_content =
            fs::read_to_string(&report_path).expect("report file should be readable");
        let lines: Vec<&str> = file_content.lines().collect();
        assert_eq!(lines, vec!["first line", "second line"]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn export_path_appends_gz_once() {
        assert_eq!(
            export_path(Path::new("out/chain.jsonl"), true),
            PathBuf::from("out/chain.jsonl.gz")
        );
        assert_eq!(
            export_path(Path::new("out/chain.jsonl.gz"), true),
            PathBuf::from("out/chain.jsonl.gz")
        );
        assert_eq!(
            export_path(Path::new("out/chain.jsonl"), false),
            PathBuf::from("out/chain.jsonl")
        );
    }

    #[test]
    fn migrate_arguments_build_a_job() {
        let CLI { command, .. } = CLI::try_parse_from([
            "ledger-migrate",
            "migrate",
            "--source.store",
            "/data/source/chaindata",
            "--dest.store",
            "/data/dest/chaindata",
            "--dest.engine",
            "memory",
            "--from-block",
            "5",
            "--to-block",
            "10",
            "--batch-size",
            "250",
            "--no-state",
            "--timeout-secs",
            "60",
        ])
        .expect("arguments should parse");
        let Subcommand::Migrate {
            source,
            destination,
            head,
            run,
            report,
        } = command
        else {
            panic!("expected the migrate command");
        };

        let job = build_job(
            source.descriptor().expect("one source"),
            destination.descriptor().expect("one destination"),
            &run,
            Some(&head),
            &report,
        )
        .expect("job should be valid");
        assert_eq!(job.block_range, BlockRange { start: 5, end: Some(10) });
        assert_eq!(job.batch_size, 250);
        assert!(!job.include_state);
        assert!(job.skip_existing);
        assert_eq!(job.head, HeadStrategy::Written);
        assert_eq!(job.deadline, Some(Duration::from_secs(60)));
        assert_eq!(job.worker_count, ledger_migration::job::default_worker_count());
        assert_eq!(job.resume_dir, Some(PathBuf::from("/data/dest")));
        assert_eq!(job.source.to_string(), "store:rawdb:/data/source/chaindata");
    }

    #[test]
    fn manual_head_needs_number_and_hash() {
        let head = HeadOptions {
            mode: HeadMode::Manual,
            number: Some(7),
            hash: None,
            rpc: None,
        };
        assert!(head.strategy().is_err());

        let head = HeadOptions {
            hash: Some(format!("0x{}", "11".repeat(32))),
            ..head
        };
        assert_eq!(
            head.strategy().expect("manual head should parse"),
            HeadStrategy::Manual(ChainHeadPointer {
                last_block_number: 7,
                last_block_hash: H256::repeat_byte(0x11),
            })
        );
    }

    #[test]
    fn prefixes_combine_hex_and_groups() {
        let prefixes = collect_prefixes(&["0x6c".to_string()], false, true)
            .expect("prefixes should parse");
        assert_eq!(prefixes, vec![vec![0x6c], vec![b'a'], vec![b's'], vec![b'c']]);
        assert!(collect_prefixes(&[], false, false).is_err());
        assert!(collect_prefixes(&["zz".to_string()], false, false).is_err());
    }

    #[test]
    fn namespace_must_be_32_bytes() {
        assert_eq!(
            parse_namespace(&"ab".repeat(32)).expect("namespace should parse"),
            H256::repeat_byte(0xab)
        );
        assert!(parse_namespace("0xabcd").is_err());
    }
}
