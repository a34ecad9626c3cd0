//! Run counters and periodic progress logging.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
pub const PROGRESS_RECORD_INTERVAL: u64 = 10_000;

/// Counters shared by concurrent workers. Updated with relaxed ordering and
/// read only for reporting.
#[derive(Debug, Default)]
pub struct MigrationCounters {
    imported: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    decode_errors: AtomicU64,
}

impl MigrationCounters {
    pub fn add_imported(&self, n: u64) {
        self.imported.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_decode_errors(&self, n: u64) {
        self.decode_errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            imported: self.imported.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub imported: u64,
    pub skipped: u64,
    pub errors: u64,
    pub decode_errors: u64,
}

impl CounterSnapshot {
    pub fn processed(&self) -> u64 {
        self.imported + self.skipped + self.errors
    }
}

/// Logs progress for a sequential pass every [`PROGRESS_INTERVAL`] or every
/// [`PROGRESS_RECORD_INTERVAL`] records, whichever comes first.
pub struct ProgressReporter {
    label: &'static str,
    started: Instant,
    last_report: Instant,
    last_processed: u64,
}

impl ProgressReporter {
    pub fn new(label: &'static str) -> Self {
        let now = Instant::now();
        Self {
            label,
            started: now,
            last_report: now,
            last_processed: 0,
        }
    }

    /// Returns whether a progress line was logged.
    pub fn tick(&mut self, snapshot: CounterSnapshot) -> bool {
        let processed = snapshot.processed();
        let due = self.last_report.elapsed() >= PROGRESS_INTERVAL
            || processed.saturating_sub(self.last_processed) >= PROGRESS_RECORD_INTERVAL;
        if !due {
            return false;
        }
        log_progress(self.label, snapshot, self.started.elapsed());
        self.last_report = Instant::now();
        self.last_processed = processed;
        true
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn log_progress(label: &str, snapshot: CounterSnapshot, elapsed: Duration) {
    info!(
        phase = label,
        imported = snapshot.imported,
        skipped = snapshot.skipped,
        errors = snapshot.errors,
        decode_errors = snapshot.decode_errors,
        rate = format!("{:.1}/s", throughput(snapshot.imported, elapsed)),
        "Progress"
    );
}

pub fn throughput(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// Logs the shared counters every [`PROGRESS_INTERVAL`] until `stop` is
/// cancelled.
pub fn spawn_progress_ticker(
    label: &'static str,
    counters: Arc<MigrationCounters>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
        // First tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    log_progress(label, counters.snapshot(), started.elapsed());
                }
            }
        }
    })
}
