//! VE Apply/Rollback (C4): turn a [`CorrectionArtifact`] into an updated VE
//! table, and invert that transform later.
//!
//! Apply rejects rather than silently re-clamping when a recommended
//! change exceeds the configured authority, and records a content hash
//! alongside every artifact it writes so downstream consumers can detect
//! staleness or corruption.

use crate::config::{Config, CUMULATIVE_CAP};
use crate::error::{Error, Result, SafetyViolation};
use crate::kernel::{round4, CorrectionArtifact};
use crate::store::{canonical_json_bytes, sha256_hex};
use crate::table::{Table, VeUnit};
use serde::{Deserialize, Serialize};

fn table_hash(table: &Table<VeUnit>) -> Result<String> {
    Ok(sha256_hex(&canonical_json_bytes(table)?))
}

/// Record of one apply, sufficient to verify and later roll it back
/// without needing to re-derive the original cell values from scratch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplyMetadata {
    pub base_ve_hash: String,
    pub updated_ve_hash: String,
    pub factor_artifact_sha256: String,
    /// Per-cell cumulative `(1 + delta/100)` product across this lineage,
    /// including this apply.
    pub cumulative: Vec<f64>,
    pub dry_run: bool,
}

/// Apply `artifact` to `base_ve`, producing the updated table and its
/// metadata. Never mutates `base_ve`; the caller decides whether to
/// persist the result (a `dry_run` apply is computed identically but the
/// caller is expected not to write it to the store).
///
/// # Errors
///
/// - [`Error::InvalidInput`] if `base_ve`'s grid does not match the
///   artifact's grid.
/// - [`Error::SafetyViolation`] (`HashMismatch`) if `artifact` fails its
///   own embedded self-hash check (tampered or corrupted artifact).
/// - [`Error::SafetyViolation`] (`HashMismatch`) if `expected_base_hash` is
///   given and does not match `base_ve`'s actual hash.
/// - [`Error::SafetyViolation`] (`ClampExceeded`) if any cell's delta
///   exceeds `config.clamp_pct` — the apply step never re-clamps, only
///   rejects.
/// - [`Error::SafetyViolation`] (`CumulativeCapExceeded`) if the lineage's
///   cumulative multiplier would leave `[1/CUMULATIVE_CAP, CUMULATIVE_CAP]`.
/// - [`Error::SafetyViolation`] (`VeOutOfRange`) if an updated cell would
///   leave the valid VE range.
pub fn apply(
    base_ve: &Table<VeUnit>,
    artifact: &CorrectionArtifact,
    expected_base_hash: Option<&str>,
    previous_cumulative: Option<&[f64]>,
    dry_run: bool,
    config: &Config,
) -> Result<(Table<VeUnit>, ApplyMetadata)> {
    if base_ve.grid() != &artifact.grid {
        return Err(Error::InvalidInput(
            "base VE table dimensions do not match the correction artifact's grid".to_owned(),
        ));
    }

    if !artifact.verify_self_hash() {
        return Err(SafetyViolation::HashMismatch {
            expected: artifact.sha256.clone(),
            actual: crate::kernel::compute_artifact_hash(artifact),
        }
        .into());
    }

    let base_hash = table_hash(base_ve)?;
    if let Some(expected) = expected_base_hash {
        if expected != base_hash {
            return Err(SafetyViolation::HashMismatch {
                expected: expected.to_owned(),
                actual: base_hash,
            }
            .into());
        }
    }

    let n = base_ve.grid().n_cells();
    let n_map = base_ve.grid().n_map();
    let prior = previous_cumulative
        .map(<[f64]>::to_vec)
        .unwrap_or_else(|| vec![1.0; n]);
    if prior.len() != n {
        return Err(Error::InvalidInput(
            "previous cumulative vector does not match grid size".to_owned(),
        ));
    }

    let mut updated_cells = Vec::with_capacity(n);
    let mut cumulative = Vec::with_capacity(n);

    for idx in 0..n {
        let i = idx / n_map;
        let j = idx % n_map;
        let delta = artifact.factor[idx];

        if delta.abs() > config.clamp_pct + f64::EPSILON {
            return Err(SafetyViolation::ClampExceeded {
                i,
                j,
                delta,
                max: config.clamp_pct,
            }
            .into());
        }

        let multiplier = 1.0 + delta / 100.0;
        let cell_cumulative = prior[idx] * multiplier;
        if cell_cumulative > CUMULATIVE_CAP || cell_cumulative < 1.0 / CUMULATIVE_CAP {
            return Err(SafetyViolation::CumulativeCapExceeded {
                i,
                j,
                cumulative: cell_cumulative,
            }
            .into());
        }

        let updated = round4(base_ve.cells()[idx] * multiplier);
        if !(0.3..=1.5).contains(&updated) {
            return Err(SafetyViolation::VeOutOfRange {
                i,
                j,
                value: updated,
            }
            .into());
        }

        updated_cells.push(updated);
        cumulative.push(cell_cumulative);
    }

    let updated_ve = Table::new(base_ve.grid().clone(), updated_cells)?;
    let updated_hash = table_hash(&updated_ve)?;

    if !dry_run {
        log::info!(
            "apply: base hash {} -> updated hash {}, {} cells clamped",
            &base_hash[..12],
            &updated_hash[..12],
            artifact.clamped_count()
        );
    }

    let metadata = ApplyMetadata {
        base_ve_hash: base_hash,
        updated_ve_hash: updated_hash,
        factor_artifact_sha256: artifact.sha256.clone(),
        cumulative,
        dry_run,
    };

    Ok((updated_ve, metadata))
}

/// Invert an apply, reconstructing the base VE table from the current
/// (updated) table and the same artifact used to produce it.
///
/// # Errors
///
/// - [`Error::SafetyViolation`] (`HashMismatch`) if `current_ve`'s hash
///   does not match `metadata.updated_ve_hash` — the caller is rolling
///   back against a table that is not the one this metadata describes.
/// - [`Error::SafetyViolation`] (`InverseVerificationFailed`) if the
///   reconstructed table's hash does not match `metadata.base_ve_hash`.
pub fn rollback(
    current_ve: &Table<VeUnit>,
    artifact: &CorrectionArtifact,
    metadata: &ApplyMetadata,
) -> Result<Table<VeUnit>> {
    let current_hash = table_hash(current_ve)?;
    if current_hash != metadata.updated_ve_hash {
        return Err(SafetyViolation::HashMismatch {
            expected: metadata.updated_ve_hash.clone(),
            actual: current_hash,
        }
        .into());
    }

    let n = current_ve.grid().n_cells();
    let mut restored_cells = Vec::with_capacity(n);
    for idx in 0..n {
        let multiplier = 1.0 + artifact.factor[idx] / 100.0;
        restored_cells.push(round4(current_ve.cells()[idx] / multiplier));
    }

    let restored = Table::new(current_ve.grid().clone(), restored_cells)?;
    let restored_hash = table_hash(&restored)?;
    if restored_hash != metadata.base_ve_hash {
        return Err(SafetyViolation::InverseVerificationFailed {
            restored: restored_hash,
            base: metadata.base_ve_hash.clone(),
        }
        .into());
    }

    log::info!("rollback: restored hash {} verified", &restored_hash[..12]);
    Ok(restored)
}
