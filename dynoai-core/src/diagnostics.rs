//! Diagnostics (C5): summarize a [`CorrectionArtifact`] into the numbers
//! and flags a tuner actually looks at before trusting it.
//!
//! Coverage percentage, clamp rate, and a small set of named anomaly
//! checks stand in for a single opaque confidence score, and statistics
//! lean on medians over means for outlier robustness.

use crate::grid::Cell;
use crate::kernel::CorrectionArtifact;
use serde::{Deserialize, Serialize};

/// Minimum `|delta|`, in percent, for a cell to count as "high magnitude"
/// when looking for adjacent clusters.
const HIGH_MAGNITUDE_FRACTION_OF_CLAMP: f64 = 0.8;

/// Minimum cluster size (connected cells) to report as an anomaly.
const CLUSTER_MIN_SIZE: usize = 3;

/// Safe range for a cell's commanded (target) AFR; outside this range the
/// sample that produced the cell is flagged even though nothing in the
/// correction itself is unsafe. Matches `AfrTargetUnit`'s own valid range.
const SAFE_AFR_TARGET_RANGE: (f64, f64) = (9.0, 18.0);

/// Minimum `|delta|`, in percent, for a front/rear disagreement at the
/// same cell to count as a meaningful sign flip rather than noise.
const SIGN_FLIP_MIN_MAGNITUDE_PCT: f64 = 2.0;

/// Mean absolute deviation, in AFR units, at or above which the
/// consistency sub-score bottoms out at 0.
const CONSISTENCY_MAD_CEILING: f64 = 1.0;

/// Points deducted from the anomaly sub-score per anomaly found.
const ANOMALY_SCORE_PENALTY_PER_ANOMALY: f64 = 25.0;

const COVERAGE_WEIGHT: f64 = 0.4;
const CONSISTENCY_WEIGHT: f64 = 0.3;
const ANOMALY_WEIGHT: f64 = 0.15;
const CLAMPING_WEIGHT: f64 = 0.15;

/// A named anomaly surfaced to the tuner, independent of whether the
/// underlying correction was itself rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Anomaly {
    /// A connected group of cells all near the clamp boundary — usually
    /// means the base VE table is wrong in that region, not that the
    /// correction itself is wrong.
    AdjacentHighMagnitudeCluster { cells: Vec<Cell> },
    /// Front and rear banks disagree on direction at the same operating
    /// point, both above the noise floor.
    SignFlip { cell: Cell, front_delta: f64, rear_delta: f64 },
    /// A cell's commanded (target) AFR falls outside the safe range.
    DeadbandViolation { cell: Cell, afr_target: f64 },
}

/// Confidence grade for a correction artifact, from most (`A`) to least
/// (`D`) trustworthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceGrade {
    A,
    B,
    C,
    D,
}

impl std::fmt::Display for ConfidenceGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        };
        write!(f, "{c}")
    }
}

/// Full diagnostic summary for one correction artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Percentage of grid cells with at least one hit.
    pub coverage_pct: f64,
    /// Median absolute deviation of the per-cell mean AFR error, across
    /// cells with at least one hit.
    pub mad_afr_error: f64,
    /// `clamped cells / corrected cells`, where "corrected" means the
    /// cell carries a nonzero final delta.
    pub clamp_fraction: f64,
    pub anomalies: Vec<Anomaly>,
    /// Weighted 0-100 score (coverage 0.4, consistency 0.3, anomalies
    /// 0.15, clamping 0.15) that [`Diagnostics::confidence_grade`] is the
    /// letter-mapped form of.
    pub confidence_score: f64,
    pub confidence_grade: ConfidenceGrade,
}

fn median_of(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn coverage_pct(artifact: &CorrectionArtifact) -> f64 {
    if artifact.hit_count.is_empty() {
        return 0.0;
    }
    let hit = artifact.hit_count.iter().filter(|&&h| h > 0).count();
    100.0 * hit as f64 / artifact.hit_count.len() as f64
}

fn mad_afr_error(artifact: &CorrectionArtifact) -> f64 {
    let errors: Vec<f64> = artifact
        .hit_count
        .iter()
        .zip(&artifact.afr_error)
        .filter(|(&h, _)| h > 0)
        .map(|(_, &e)| e)
        .collect();
    if errors.is_empty() {
        return 0.0;
    }
    let center = median_of(errors.clone());
    let deviations: Vec<f64> = errors.iter().map(|&e| (e - center).abs()).collect();
    median_of(deviations)
}

fn clamp_fraction(artifact: &CorrectionArtifact) -> f64 {
    let corrected = artifact.factor.iter().filter(|&&d| d != 0.0).count();
    if corrected == 0 {
        return 0.0;
    }
    artifact.clamped_count() as f64 / corrected as f64
}

fn deadband_violations(artifact: &CorrectionArtifact) -> Vec<Anomaly> {
    let (lo, hi) = SAFE_AFR_TARGET_RANGE;
    let n_map = artifact.grid.n_map();
    artifact
        .hit_count
        .iter()
        .zip(&artifact.afr_cmd_median)
        .enumerate()
        .filter(|&(_, (&h, &target))| h > 0 && !(lo..=hi).contains(&target))
        .map(|(idx, (_, &target))| Anomaly::DeadbandViolation {
            cell: (idx / n_map, idx % n_map),
            afr_target: target,
        })
        .collect()
}

fn high_magnitude_clusters(artifact: &CorrectionArtifact) -> Vec<Anomaly> {
    let threshold = artifact.clamp_pct * HIGH_MAGNITUDE_FRACTION_OF_CLAMP;
    let n_map = artifact.grid.n_map();
    let n = artifact.factor.len();

    let is_high = |idx: usize| artifact.factor[idx].abs() >= threshold;
    let mut visited = vec![false; n];
    let mut anomalies = Vec::new();

    for start in 0..n {
        if visited[start] || !is_high(start) {
            continue;
        }
        let mut stack = vec![start];
        let mut component = Vec::new();
        visited[start] = true;
        while let Some(idx) = stack.pop() {
            component.push(idx);
            let cell = (idx / n_map, idx % n_map);
            for neighbor in artifact.grid.neighbors(cell) {
                let nidx = artifact.grid.flat_index(neighbor);
                if !visited[nidx] && is_high(nidx) {
                    visited[nidx] = true;
                    stack.push(nidx);
                }
            }
        }
        if component.len() >= CLUSTER_MIN_SIZE {
            let cells = component.into_iter().map(|idx| (idx / n_map, idx % n_map)).collect();
            anomalies.push(Anomaly::AdjacentHighMagnitudeCluster { cells });
        }
    }

    anomalies
}

/// Compare front and rear correction artifacts for the same grid, looking
/// for cells where the two banks disagree on direction by more than the
/// noise floor.
#[must_use]
pub fn sign_flips(front: &CorrectionArtifact, rear: &CorrectionArtifact) -> Vec<Anomaly> {
    if front.grid != rear.grid {
        return Vec::new();
    }
    let n_map = front.grid.n_map();
    front
        .factor
        .iter()
        .zip(&rear.factor)
        .enumerate()
        .filter_map(|(idx, (&f, &r))| {
            let meaningful = f.abs() >= SIGN_FLIP_MIN_MAGNITUDE_PCT && r.abs() >= SIGN_FLIP_MIN_MAGNITUDE_PCT;
            if meaningful && f.signum() != r.signum() {
                Some(Anomaly::SignFlip {
                    cell: (idx / n_map, idx % n_map),
                    front_delta: f,
                    rear_delta: r,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Weighted 0-100 confidence score: coverage 0.4, consistency 0.3,
/// anomalies 0.15, clamping 0.15.
fn confidence_score(coverage_pct: f64, clamp_fraction: f64, mad_afr_error: f64, anomaly_count: usize) -> f64 {
    let coverage_score = coverage_pct.clamp(0.0, 100.0);
    let consistency_score = (100.0 * (1.0 - mad_afr_error / CONSISTENCY_MAD_CEILING)).clamp(0.0, 100.0);
    let anomaly_score =
        (100.0 - ANOMALY_SCORE_PENALTY_PER_ANOMALY * anomaly_count as f64).clamp(0.0, 100.0);
    let clamping_score = (100.0 * (1.0 - clamp_fraction)).clamp(0.0, 100.0);

    COVERAGE_WEIGHT * coverage_score
        + CONSISTENCY_WEIGHT * consistency_score
        + ANOMALY_WEIGHT * anomaly_score
        + CLAMPING_WEIGHT * clamping_score
}

fn grade(score: f64) -> ConfidenceGrade {
    if score >= 85.0 {
        ConfidenceGrade::A
    } else if score >= 70.0 {
        ConfidenceGrade::B
    } else if score >= 50.0 {
        ConfidenceGrade::C
    } else {
        ConfidenceGrade::D
    }
}

/// Build the full diagnostic summary for `artifact`.
#[must_use]
pub fn diagnose(artifact: &CorrectionArtifact) -> Diagnostics {
    let coverage_pct = coverage_pct(artifact);
    let mad_afr_error = mad_afr_error(artifact);
    let clamp_fraction = clamp_fraction(artifact);

    let mut anomalies = high_magnitude_clusters(artifact);
    anomalies.extend(deadband_violations(artifact));

    let confidence_score = confidence_score(coverage_pct, clamp_fraction, mad_afr_error, anomalies.len());
    let confidence_grade = grade(confidence_score);

    if confidence_grade == ConfidenceGrade::D {
        log::warn!(
            "diagnostics: grade D, score {confidence_score:.1}, coverage {coverage_pct:.1}%, clamp_fraction {clamp_fraction:.2}, {} anomalies",
            anomalies.len()
        );
    }

    Diagnostics {
        coverage_pct,
        mad_afr_error,
        clamp_fraction,
        anomalies,
        confidence_score,
        confidence_grade,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    fn artifact(factor: Vec<f64>, hit_count: Vec<u64>, clamped: Vec<bool>) -> CorrectionArtifact {
        let n = hit_count.len();
        artifact_with_targets(factor, hit_count, clamped, vec![13.5; n])
    }

    fn artifact_with_targets(
        factor: Vec<f64>,
        hit_count: Vec<u64>,
        clamped: Vec<bool>,
        afr_cmd_median: Vec<f64>,
    ) -> CorrectionArtifact {
        let grid = Grid::new(vec![1000.0, 2000.0, 3000.0], vec![20.0, 40.0, 60.0]).unwrap();
        let n = grid.n_cells();
        CorrectionArtifact {
            grid,
            factor,
            hit_count,
            afr_error: vec![0.0; n],
            afr_cmd_median,
            clamped,
            clamp_pct: 7.0,
            smooth_passes: 2,
            kernel_version: "k1".to_owned(),
            math_version: "1.0.0".to_owned(),
            sha256: "deadbeef".to_owned(),
        }
    }

    #[test]
    fn full_coverage_no_anomalies_grades_a() {
        let d = diagnose(&artifact(vec![0.1; 9], vec![20; 9], vec![false; 9]));
        assert_eq!(d.coverage_pct, 100.0);
        assert_eq!(d.confidence_score, 100.0);
        assert_eq!(d.confidence_grade, ConfidenceGrade::A);
        assert!(d.anomalies.is_empty());
    }

    #[test]
    fn zero_coverage_alone_is_not_enough_for_the_worst_grade() {
        // Coverage is only 0.4 of the weighted score; a cylinder with zero
        // coverage but no other problems still scores 60 (0.3 consistency +
        // 0.15 anomalies + 0.15 clamping, all perfect), which is a C, not a D.
        let d = diagnose(&artifact(vec![0.0; 9], vec![0; 9], vec![false; 9]));
        assert_eq!(d.coverage_pct, 0.0);
        assert!((d.confidence_score - 60.0).abs() < 1e-9);
        assert_eq!(d.confidence_grade, ConfidenceGrade::C);
    }

    #[test]
    fn combined_problems_grade_d() {
        let mut afr_error = vec![0.0; 9];
        afr_error.fill(1.2);
        let mut hit_count = vec![20; 9];
        hit_count[8] = 0;
        let mut clamped = vec![true; 9];
        clamped[8] = false;
        let mut artifact = artifact(vec![7.0; 9], hit_count, clamped);
        artifact.afr_error = afr_error;
        let d = diagnose(&artifact);
        assert_eq!(d.confidence_grade, ConfidenceGrade::D);
    }

    #[test]
    fn deadband_violation_is_flagged() {
        let mut targets = vec![13.5; 9];
        targets[0] = 20.0;
        let d = diagnose(&artifact_with_targets(vec![0.0; 9], vec![20; 9], vec![false; 9], targets));
        assert!(d
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::DeadbandViolation { afr_target, .. } if (*afr_target - 20.0).abs() < 1e-9)));
    }

    #[test]
    fn deadband_check_ignores_cells_with_no_hits() {
        let mut targets = vec![13.5; 9];
        targets[0] = 25.0;
        let d = diagnose(&artifact_with_targets(vec![0.0; 9], vec![0; 9], vec![false; 9], targets));
        assert!(d.anomalies.is_empty());
    }

    #[test]
    fn adjacent_high_magnitude_cluster_is_flagged() {
        let mut factor = vec![0.0; 9];
        // center cross: cells (1,1), (0,1), (1,0) at >= 0.8*7.0 = 5.6
        factor[4] = 6.5;
        factor[1] = 6.5;
        factor[3] = 6.5;
        let d = diagnose(&artifact(factor, vec![20; 9], vec![false; 9]));
        assert!(d
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::AdjacentHighMagnitudeCluster { cells } if cells.len() >= 3)));
    }

    #[test]
    fn sign_flip_detected_between_banks() {
        let front = artifact(vec![5.0; 9], vec![20; 9], vec![false; 9]);
        let rear = artifact(vec![-5.0; 9], vec![20; 9], vec![false; 9]);
        let flips = sign_flips(&front, &rear);
        assert_eq!(flips.len(), 9);
    }

    #[test]
    fn sign_flip_ignores_noise_level_disagreement() {
        let front = artifact(vec![0.5; 9], vec![20; 9], vec![false; 9]);
        let rear = artifact(vec![-0.5; 9], vec![20; 9], vec![false; 9]);
        assert!(sign_flips(&front, &rear).is_empty());
    }

    #[test]
    fn clamp_fraction_counts_only_corrected_cells() {
        let mut factor = vec![0.0; 9];
        factor[0] = 7.0;
        factor[1] = 3.0;
        let mut clamped = vec![false; 9];
        clamped[0] = true;
        let d = diagnose(&artifact(factor, vec![20; 9], clamped));
        assert!((d.clamp_fraction - 0.5).abs() < 1e-9);
    }
}
