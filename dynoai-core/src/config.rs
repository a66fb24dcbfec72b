//! Frozen configuration record.
//!
//! A closed set of fields rather than an open dict; unknown options are
//! rejected at parse time by the CLI layer (there is no dynamic map here
//! to reject options *into*).

use serde::{Deserialize, Serialize};

/// Identifies which correction kernel variant is in effect. Switching
/// variant changes [`Config::math_version`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum KernelVariant {
    /// Gradient-limited, coverage-weighted smoothing (the default).
    K1,
    /// Coverage-only variant gated behind a distinct math version.
    K2Coverage,
    /// Spark-timing-aware variant gated behind a distinct math version.
    K3Spark,
}

impl Default for KernelVariant {
    fn default() -> Self {
        Self::K1
    }
}

/// Optional range checks on fields the mandatory filter in the bin
/// aggregator does not already constrain (RPM, MAP, and the relevant
/// cylinder's AFR pair are always checked; these are additive).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SampleFilterConfig {
    /// Inclusive `(min, max)` bound on intake-air temperature, Kelvin.
    pub iat_range: Option<(f64, f64)>,
    /// Inclusive `(min, max)` bound on throttle position, percent.
    pub tps_range: Option<(f64, f64)>,
    /// Minimum engine coolant temperature, Kelvin.
    pub ect_min: Option<f64>,
}

/// Every option the core recognizes. Unknown fields are a parse-time error
/// at the CLI boundary; the core itself only ever sees this closed record.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Maximum absolute percentage delta a cell may carry after clamping.
    /// Default 7, hard ceiling 12 (`DYNOAI_MAX_CLAMP_PCT`).
    pub clamp_pct: f64,
    /// Number of gradient-limited smoothing passes. Default 2.
    pub smooth_passes: u32,
    /// Semver tag embedded in every correction artifact.
    pub math_version: String,
    /// Which correction kernel computes the raw per-cell delta.
    pub kernel_variant: KernelVariant,
    /// Hit count at which a cell reaches full coverage weight. Default 10.
    pub min_hits_for_full_weight: u32,
    /// Maximum per-pass change between neighboring smoothed cells. Default 3.0.
    pub max_gradient_pct: f64,
    /// Closed-loop convergence threshold on `max_afr_error`. Default 0.3.
    pub convergence_threshold_afr: f64,
    /// Closed-loop iteration budget. Default 10, hard ceiling 50.
    pub max_iterations: u32,
    /// Oscillation-detection margin. Default 0.2.
    pub oscillation_margin: f64,
    /// Closed-loop wall-clock budget, seconds. Default 60.
    pub wall_clock_budget_sec: u64,
    /// Seed for the virtual ECU's deterministic noise generator. Default 0.
    pub seed: u64,
    /// Additive range checks beyond the mandatory AFR/MAP filter.
    pub sample_filters: SampleFilterConfig,
}

/// Cells whose coverage weight falls below this threshold are "sparse":
/// they never drive a correction and only receive smoothed neighbor
/// influence.
pub const SPARSE_WEIGHT_THRESHOLD: f64 = 0.2;

/// Hard ceiling on `clamp_pct` regardless of configuration
/// (`DYNOAI_MAX_CLAMP_PCT` default).
pub const MAX_CLAMP_PCT_CEILING: f64 = 12.0;

/// Cumulative cap on net VE change across successive applies on one
/// lineage: `(1 + delta/100)` products must stay within this multiple.
pub const CUMULATIVE_CAP: f64 = 1.5;

/// Hard ceiling on closed-loop iteration count.
pub const MAX_ITERATIONS_CEILING: u32 = 50;

impl Default for Config {
    fn default() -> Self {
        Self {
            clamp_pct: 7.0,
            smooth_passes: 2,
            math_version: "1.0.0".to_owned(),
            kernel_variant: KernelVariant::K1,
            min_hits_for_full_weight: 10,
            max_gradient_pct: 3.0,
            convergence_threshold_afr: 0.3,
            max_iterations: 10,
            oscillation_margin: 0.2,
            wall_clock_budget_sec: 60,
            seed: 0,
            sample_filters: SampleFilterConfig::default(),
        }
    }
}

impl Config {
    /// Validate the record against the hard ceilings that no configuration
    /// may exceed, independent of caller intent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::InvalidInput`] if `clamp_pct` exceeds
    /// [`MAX_CLAMP_PCT_CEILING`] or `max_iterations` exceeds
    /// [`MAX_ITERATIONS_CEILING`].
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.clamp_pct <= 0.0 || self.clamp_pct > MAX_CLAMP_PCT_CEILING {
            return Err(crate::error::Error::InvalidInput(format!(
                "clamp_pct {} outside (0, {}]",
                self.clamp_pct, MAX_CLAMP_PCT_CEILING
            )));
        }
        if self.max_iterations == 0 || self.max_iterations > MAX_ITERATIONS_CEILING {
            return Err(crate::error::Error::InvalidInput(format!(
                "max_iterations {} outside [1, {}]",
                self.max_iterations, MAX_ITERATIONS_CEILING
            )));
        }
        if self.smooth_passes > 16 {
            return Err(crate::error::Error::InvalidInput(format!(
                "smooth_passes {} is implausibly large",
                self.smooth_passes
            )));
        }
        Ok(())
    }
}
