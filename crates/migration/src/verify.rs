//! Spot checks of a destination store after a migration.
//!
//! A handful of heights spread over the chain are sampled; each must have a
//! canonical hash and a header stored under that hash. Problems are reported
//! as warnings and never fail the run.

use std::collections::BTreeSet;

use ethereum_types::H256;
use ledger_storage::{StorageBackend, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    head::read_markers,
    schema::{HASH_LENGTH, KeyCodec, LedgerRecordKind},
};

const FIXED_SAMPLES: [u64; 5] = [0, 1, 100, 1_000, 10_000];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationWarning {
    #[error("no canonical hash for block {number}")]
    MissingCanonical { number: u64 },
    #[error("canonical hash for block {number} has {len} bytes")]
    MalformedCanonical { number: u64, len: usize },
    #[error("header {hash:#x} for block {number} is missing")]
    MissingHeader { number: u64, hash: H256 },
    #[error("none of the sampled blocks were found")]
    NoSamplesFound,
    #[error("head markers diverge: {0}")]
    HeadMarkersDiverge(String),
    #[error("store read failed: {0}")]
    StoreRead(String),
}

impl From<StoreError> for VerificationWarning {
    fn from(error: StoreError) -> Self {
        VerificationWarning::StoreRead(error.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub checked: u64,
    pub found: u64,
    pub misses: Vec<u64>,
    pub warnings: Vec<VerificationWarning>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.found == self.checked && self.warnings.is_empty()
    }
}

/// Heights sampled for a chain whose head is `last`, ascending and unique.
pub fn sample_points(last: u64) -> Vec<u64> {
    FIXED_SAMPLES
        .into_iter()
        .chain([last / 2, last.saturating_sub(1), last])
        .filter(|n| *n <= last)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub struct Verifier<'a> {
    backend: &'a dyn StorageBackend,
    codec: &'a KeyCodec,
}

impl<'a> Verifier<'a> {
    pub fn new(backend: &'a dyn StorageBackend, codec: &'a KeyCodec) -> Self {
        Self { backend, codec }
    }

    pub fn verify(&self, last: u64) -> VerificationReport {
        let mut report = VerificationReport::default();
        for number in sample_points(last) {
            report.checked += 1;
            match self.check_block(number) {
                Ok(()) => report.found += 1,
                Err(warning) => {
                    warn!(block = number, %warning, "Verification sample missing");
                    report.misses.push(number);
                    report.warnings.push(warning);
                }
            }
        }
        if report.checked > 0 && report.found == 0 {
            report.warnings.push(VerificationWarning::NoSamplesFound);
        }

        match read_markers(self.backend, self.codec) {
            Ok(markers) if markers.is_consistent() => {}
            Ok(markers) => report.warnings.push(VerificationWarning::HeadMarkersDiverge(format!(
                "LastBlock={:?} LastHeader={:?} LastFast={:?}",
                markers.last_block, markers.last_header, markers.last_fast
            ))),
            Err(error) => report
                .warnings
                .push(VerificationWarning::HeadMarkersDiverge(error.to_string())),
        }

        info!(
            found = report.found,
            checked = report.checked,
            warnings = report.warnings.len(),
            "Verification finished"
        );
        report
    }

    fn check_block(&self, number: u64) -> Result<(), VerificationWarning> {
        let canonical_key = self
            .codec
            .encode(LedgerRecordKind::CanonicalHash, Some(number), None)
            .map_err(|e| VerificationWarning::StoreRead(e.to_string()))?;
        let raw = self
            .backend
            .get(&canonical_key)?
            .ok_or(VerificationWarning::MissingCanonical { number })?;
        if raw.len() != HASH_LENGTH {
            return Err(VerificationWarning::MalformedCanonical {
                number,
                len: raw.len(),
            });
        }
        let hash = H256::from_slice(&raw);
        let header_key = self
            .codec
            .encode(LedgerRecordKind::Header, Some(number), Some(hash))
            .map_err(|e| VerificationWarning::StoreRead(e.to_string()))?;
        if !self.backend.contains(&header_key)? {
            return Err(VerificationWarning::MissingHeader { number, hash });
        }
        Ok(())
    }
}
