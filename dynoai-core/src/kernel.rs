//! Correction Kernel (C3): the mathematical heart of the system.
//!
//! Computes per-cell correction percentages from binned AFR statistics via
//! gradient-limited, coverage-weighted smoothing (kernel variant K1),
//! clamps them to a safety bound, and zeroes out cells whose coverage
//! remains too sparse to trust. The clamp-against-a-fixed-authority idea
//! generalizes from a single-cell bound into a grid-wide, neighbor-aware
//! smoothing pass; the whole thing stays an explicit, synchronous, fully
//! specified numeric pass rather than anything streaming or order-dependent.

use crate::aggregate::CellStats;
use crate::config::{Config, KernelVariant, SPARSE_WEIGHT_THRESHOLD};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::store::{canonical_json_bytes, sha256_hex};
use crate::table::{Table, VeUnit};
use serde::{Deserialize, Serialize};

/// Round to exactly four decimal digits, ties-to-even. `factor = 1 +
/// delta/100` and all downstream consumers must use this rounded value,
/// never the raw smoothed float.
#[must_use]
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round_ties_even() / 10_000.0
}

/// Immutable, content-hashed output of one kernel run for one cylinder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrectionArtifact {
    pub grid: Grid,
    /// Final per-cell percentage delta, 4-decimal rounded.
    pub factor: Vec<f64>,
    pub hit_count: Vec<u64>,
    /// Mean signed AFR error per cell (diagnostic passthrough from C2).
    pub afr_error: Vec<f64>,
    /// Median commanded AFR per cell (diagnostic passthrough from C2); 0.0
    /// for cells with no hits.
    pub afr_cmd_median: Vec<f64>,
    pub clamped: Vec<bool>,
    pub clamp_pct: f64,
    pub smooth_passes: u32,
    pub kernel_version: String,
    pub math_version: String,
    pub sha256: String,
}

impl CorrectionArtifact {
    /// Number of cells whose `|delta| == clamp_pct` after clamping.
    #[must_use]
    pub fn clamped_count(&self) -> usize {
        self.clamped.iter().filter(|&&c| c).count()
    }

    /// Verify the artifact's embedded hash matches its own content.
    #[must_use]
    pub fn verify_self_hash(&self) -> bool {
        compute_artifact_hash(self) == self.sha256
    }
}

pub(crate) fn compute_artifact_hash(artifact: &CorrectionArtifact) -> String {
    let mut unsigned = artifact.clone();
    unsigned.sha256.clear();
    let bytes = canonical_json_bytes(&unsigned).expect("artifact is always serializable");
    sha256_hex(&bytes)
}

fn kernel_name(variant: KernelVariant) -> &'static str {
    match variant {
        KernelVariant::K1 => "k1",
        KernelVariant::K2Coverage => "k2_coverage",
        KernelVariant::K3Spark => "k3_spark",
    }
}

fn coverage_weight(hit_count: u64, min_hits_for_full_weight: u32) -> f64 {
    if min_hits_for_full_weight == 0 {
        return 1.0;
    }
    (hit_count as f64 / f64::from(min_hits_for_full_weight)).min(1.0)
}

/// Run the correction kernel over one cylinder's binned statistics.
///
/// # Errors
///
/// - [`Error::InvalidInput`] if `base_ve`'s grid does not match `stats`'
///   grid (`MismatchedDimensions`), or if `config.kernel_variant` is not
///   yet implemented (`UnsupportedKernel` — only K1 is implemented).
/// - [`Error::InvariantViolation`] if a NaN appears post-smoothing; this is
///   always a bug in the kernel, never caller-triggerable under normal
///   inputs.
pub fn correct(
    stats: &[CellStats],
    grid: &Grid,
    base_ve: &Table<VeUnit>,
    config: &Config,
) -> Result<CorrectionArtifact> {
    if base_ve.grid() != grid {
        return Err(Error::InvalidInput(
            "base VE table dimensions do not match the analysis grid".to_owned(),
        ));
    }
    if stats.len() != grid.n_cells() {
        return Err(Error::InvalidInput(
            "cell statistics length does not match the analysis grid".to_owned(),
        ));
    }
    if config.kernel_variant != KernelVariant::K1 {
        return Err(Error::InvalidInput(format!(
            "kernel variant {:?} is not implemented",
            config.kernel_variant
        )));
    }

    let n = grid.n_cells();

    // Step 1: raw correction per cell.
    let mut delta_raw = vec![0.0_f64; n];
    let mut weight = vec![0.0_f64; n];
    for (idx, cell) in stats.iter().enumerate() {
        if cell.hit_count == 0 {
            continue;
        }
        let factor = cell.afr_meas_median / cell.afr_cmd_median;
        delta_raw[idx] = (factor - 1.0) * 100.0;
        weight[idx] = coverage_weight(cell.hit_count, config.min_hits_for_full_weight);
    }

    // Step 3: gradient-limited smoothing, synchronous across the whole grid.
    let mut delta_prev = delta_raw.clone();
    for _pass in 0..config.smooth_passes {
        let mut delta_next = delta_prev.clone();

        for i in 0..grid.n_rpm() {
            for j in 0..grid.n_map() {
                let idx = grid.flat_index((i, j));
                let neighbors: Vec<usize> = grid
                    .neighbors((i, j))
                    .into_iter()
                    .map(|c| grid.flat_index(c))
                    .filter(|&nidx| weight[nidx] >= SPARSE_WEIGHT_THRESHOLD)
                    .collect();

                let center_weight = weight[idx].max(0.5);
                let mut total_weight = center_weight;
                let mut weighted_sum = center_weight * delta_raw[idx];

                for &nidx in &neighbors {
                    let w_n = weight[nidx];
                    total_weight += w_n;
                    weighted_sum += w_n * delta_prev[nidx];
                }

                let mut new_value = if total_weight > 0.0 {
                    weighted_sum / total_weight
                } else {
                    delta_raw[idx]
                };

                if !neighbors.is_empty() {
                    let lower = neighbors
                        .iter()
                        .map(|&nidx| delta_prev[nidx] - config.max_gradient_pct)
                        .fold(f64::NEG_INFINITY, f64::max);
                    let upper = neighbors
                        .iter()
                        .map(|&nidx| delta_prev[nidx] + config.max_gradient_pct)
                        .fold(f64::INFINITY, f64::min);
                    if lower <= upper {
                        new_value = new_value.clamp(lower, upper);
                    }
                    // if the per-neighbor caps are mutually inconsistent
                    // (lower > upper) no feasible cap exists; keep the
                    // unclamped weighted mean rather than produce NaN.
                }

                if !new_value.is_finite() {
                    return Err(Error::InvariantViolation(format!(
                        "non-finite delta at cell ({i}, {j}) after smoothing"
                    )));
                }

                delta_next[idx] = new_value;
            }
        }

        delta_prev = delta_next;
    }

    // Step 4: clamp, recording per-cell clamped flags.
    let mut clamped = vec![false; n];
    let mut delta_final = delta_prev;
    for idx in 0..n {
        let bounded = delta_final[idx].clamp(-config.clamp_pct, config.clamp_pct);
        if (bounded - delta_final[idx]).abs() > f64::EPSILON {
            clamped[idx] = true;
        }
        delta_final[idx] = bounded;
    }

    // Step 5: zero-out cells whose final weight is still below threshold.
    for idx in 0..n {
        if weight[idx] < SPARSE_WEIGHT_THRESHOLD {
            delta_final[idx] = 0.0;
            clamped[idx] = false;
        }
    }

    // Numeric policy: round to 4 decimals, ties-to-even.
    let factor: Vec<f64> = delta_final.iter().map(|&d| round4(d)).collect();
    for &f in &factor {
        if !f.is_finite() {
            return Err(Error::InvariantViolation(
                "non-finite delta in final factor table".to_owned(),
            ));
        }
    }

    let hit_count = stats.iter().map(|c| c.hit_count).collect();
    let afr_error = stats.iter().map(|c| c.mean_afr_error).collect();
    let afr_cmd_median = stats.iter().map(|c| c.afr_cmd_median).collect();

    let mut artifact = CorrectionArtifact {
        grid: grid.clone(),
        factor,
        hit_count,
        afr_error,
        afr_cmd_median,
        clamped,
        clamp_pct: config.clamp_pct,
        smooth_passes: config.smooth_passes,
        kernel_version: kernel_name(config.kernel_variant).to_owned(),
        math_version: config.math_version.clone(),
        sha256: String::new(),
    };
    artifact.sha256 = compute_artifact_hash(&artifact);

    log::debug!(
        "kernel: {} cells, {} clamped, math_version {}",
        n,
        artifact.clamped_count(),
        artifact.math_version
    );
    if n > 0 && artifact.clamped_count() as f64 / n as f64 > 0.25 {
        log::warn!(
            "kernel: {:.1}% of cells clamped at clamp_pct {}",
            100.0 * artifact.clamped_count() as f64 / n as f64,
            config.clamp_pct
        );
    }

    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        Grid::new(vec![1000.0, 2000.0, 3000.0], vec![20.0, 40.0, 60.0]).unwrap()
    }

    fn stats_all(hit_count: u64, afr_cmd: f64, afr_meas: f64) -> Vec<CellStats> {
        vec![
            CellStats {
                hit_count,
                afr_meas_median: afr_meas,
                afr_cmd_median: afr_cmd,
                mean_afr_error: afr_meas - afr_cmd,
                mean_abs_afr_error: (afr_meas - afr_cmd).abs(),
                mean_tps: 0.0,
                last_timestamp: None,
            };
            9
        ]
    }

    #[test]
    fn identity_scenario_yields_all_zero_factors() {
        let grid = grid();
        let stats = stats_all(20, 13.5, 13.5);
        let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
        let artifact = correct(&stats, &grid, &base_ve, &Config::default()).unwrap();

        assert!(artifact.factor.iter().all(|&d| d == 0.0));
        assert_eq!(artifact.clamped_count(), 0);
        assert!(artifact.verify_self_hash());
    }

    #[test]
    fn uniform_lean_clamps_to_configured_pct() {
        let grid = grid();
        // afr_meas/afr_cmd = 0.95/... wait: factor = measured/commanded.
        // A uniformly lean reading (ECU under-fuels because it thinks VE
        // is higher than actual) is modeled the same way the virtual ECU
        // produces it: afr_meas = afr_cmd * (ve_actual / ve_ecu).
        let stats = stats_all(20, 13.5, 13.5 * (0.95 / 0.85));
        let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.85).unwrap();
        let mut cfg = Config::default();
        cfg.clamp_pct = 7.0;
        let artifact = correct(&stats, &grid, &base_ve, &cfg).unwrap();

        for &d in &artifact.factor {
            assert!((d - 7.0).abs() < 1e-9, "delta {d} should clamp to 7.0");
        }
        assert_eq!(artifact.clamped_count(), grid.n_cells());
    }

    #[test]
    fn zero_hit_cell_is_always_neutral() {
        let grid = grid();
        let mut stats = stats_all(20, 13.5, 14.0);
        stats[4] = CellStats::default();
        let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
        let artifact = correct(&stats, &grid, &base_ve, &Config::default()).unwrap();
        assert_eq!(artifact.factor[4], 0.0);
    }

    #[test]
    fn sparse_cell_is_zeroed_even_with_neighbors() {
        let grid = grid();
        let mut stats = stats_all(20, 13.5, 14.5);
        // cell (1,1), flat index 4: only 1 hit -> weight 0.1 < 0.2 threshold.
        stats[4] = CellStats {
            hit_count: 1,
            afr_meas_median: 14.5,
            afr_cmd_median: 13.5,
            mean_afr_error: 1.0,
            mean_abs_afr_error: 1.0,
            mean_tps: 0.0,
            last_timestamp: None,
        };
        let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
        let artifact = correct(&stats, &grid, &base_ve, &Config::default()).unwrap();
        assert_eq!(artifact.factor[4], 0.0);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let grid = grid();
        let other_grid = Grid::new(vec![1.0, 2.0], vec![1.0, 2.0]).unwrap();
        let stats = stats_all(20, 13.5, 13.5);
        let base_ve = Table::<VeUnit>::filled(other_grid, 0.8).unwrap();
        assert!(correct(&stats, &grid, &base_ve, &Config::default()).is_err());
    }

    #[test]
    fn unsupported_kernel_variant_is_rejected() {
        let grid = grid();
        let stats = stats_all(20, 13.5, 13.5);
        let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
        let mut cfg = Config::default();
        cfg.kernel_variant = KernelVariant::K2Coverage;
        assert!(correct(&stats, &grid, &base_ve, &cfg).is_err());
    }

    #[test]
    fn round4_ties_to_even() {
        assert_eq!(round4(1.00005), 1.0);
        assert_eq!(round4(1.00015), 1.0002);
        assert_eq!(round4(-1.00005), -1.0);
    }

    #[test]
    fn determinism_same_input_same_hash() {
        let grid = grid();
        let stats = stats_all(20, 13.5, 14.0);
        let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
        let a = correct(&stats, &grid, &base_ve, &Config::default()).unwrap();
        let b = correct(&stats, &grid, &base_ve, &Config::default()).unwrap();
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.factor, b.factor);
    }

}
