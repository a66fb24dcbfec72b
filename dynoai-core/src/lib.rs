#![warn(clippy::all, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! Deterministic volumetric-efficiency correction: bin dyno-log samples
//! onto an RPM x MAP grid, derive a gradient-limited, coverage-weighted
//! correction factor table, apply (and later roll back) that table
//! against a base VE table, and optionally close the loop against a
//! virtual ECU to converge a tune without hardware.
//!
//! This crate is the core: it does no argument parsing and no process
//! exit handling (see the companion `dynoai-cli` crate for that). Its
//! only I/O is the content-addressed artifact store in [`store`].

pub mod aggregate;
pub mod apply;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod grid;
pub mod kernel;
pub mod orchestrator;
pub mod sample;
pub mod store;
pub mod table;
pub mod virtual_ecu;

use aggregate::aggregate;
use apply::ApplyMetadata;
use config::Config;
use diagnostics::Diagnostics;
use error::Result;
use grid::Grid;
use kernel::CorrectionArtifact;
use sample::{Cylinder, LogSample};
use table::{Table, VeUnit};

/// Result of analyzing one cylinder's log against its base VE table: the
/// correction artifact the kernel produced, plus the diagnostics a tuner
/// reviews before applying it.
#[derive(Clone, Debug)]
pub struct AnalyzeResult {
    pub artifact: CorrectionArtifact,
    pub diagnostics: Diagnostics,
    pub rejections: aggregate::RejectionReport,
}

/// Public API facade, C9: bin a log, run the correction kernel, and
/// diagnose the result for one cylinder bank.
///
/// # Errors
///
/// Returns whatever [`kernel::correct`] returns: [`error::Error::InvalidInput`]
/// on a dimension mismatch, or [`error::Error::InvariantViolation`] if
/// smoothing produces a non-finite value (a kernel bug, not a caller
/// mistake).
pub fn analyze(
    samples: &[LogSample],
    grid: &Grid,
    cylinder: Cylinder,
    base_ve: &Table<VeUnit>,
    config: &Config,
) -> Result<AnalyzeResult> {
    config.validate()?;
    let aggregated = aggregate(samples, grid, cylinder, config);
    let artifact = kernel::correct(&aggregated.cells, grid, base_ve, config)?;
    let diagnostics = diagnostics::diagnose(&artifact);

    Ok(AnalyzeResult {
        artifact,
        diagnostics,
        rejections: aggregated.rejections,
    })
}

/// Public API facade: apply a correction artifact to a base VE table.
/// See [`apply::apply`] for the full error taxonomy.
///
/// # Errors
///
/// See [`apply::apply`].
pub fn apply_correction(
    base_ve: &Table<VeUnit>,
    artifact: &CorrectionArtifact,
    expected_base_hash: Option<&str>,
    previous_cumulative: Option<&[f64]>,
    dry_run: bool,
    config: &Config,
) -> Result<(Table<VeUnit>, ApplyMetadata)> {
    apply::apply(base_ve, artifact, expected_base_hash, previous_cumulative, dry_run, config)
}

/// Public API facade: invert a previous apply. See [`apply::rollback`].
///
/// # Errors
///
/// See [`apply::rollback`].
pub fn rollback(
    current_ve: &Table<VeUnit>,
    artifact: &CorrectionArtifact,
    metadata: &ApplyMetadata,
) -> Result<Table<VeUnit>> {
    apply::rollback(current_ve, artifact, metadata)
}

/// Public API facade: run a closed-loop virtual-ECU tuning session to
/// completion and return its id. See [`orchestrator::run_closed_loop`].
///
/// # Errors
///
/// See [`orchestrator::run_closed_loop`].
pub fn tune_closed_loop(
    inputs: orchestrator::SessionInputs,
    cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> Result<orchestrator::SessionId> {
    orchestrator::run_closed_loop(inputs, cancel)
}
