//! Bin Aggregator (C2): fold a finite sequence of [`LogSample`]s into
//! per-cell accumulators, independently for front/rear cylinder.
//!
//! Filters are accept-or-reject with a named reason rather than a
//! numeric score, and the reduction is an exact, order-independent fold
//! over per-cell accumulators rather than a streaming approximation.

use crate::config::{Config, SampleFilterConfig};
use crate::grid::{Cell, Grid};
use crate::sample::{Cylinder, LogSample};
use serde::{Deserialize, Serialize};

const AFR_MEAS_RANGE: (f64, f64) = (9.0, 18.0);
const MAP_RANGE: (f64, f64) = (10.0, 110.0);

/// Why a sample did not enter any cell's accumulator.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectionReport {
    pub missing_rpm_or_map: u64,
    pub map_out_of_range: u64,
    pub missing_afr: u64,
    pub afr_out_of_range: u64,
    pub iat_out_of_range: u64,
    pub tps_out_of_range: u64,
    pub ect_out_of_range: u64,
}

impl RejectionReport {
    /// Total rejected samples across every reason.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.missing_rpm_or_map
            + self.map_out_of_range
            + self.missing_afr
            + self.afr_out_of_range
            + self.iat_out_of_range
            + self.tps_out_of_range
            + self.ect_out_of_range
    }
}

enum Reject {
    MissingRpmOrMap,
    MapOutOfRange,
    MissingAfr,
    AfrOutOfRange,
    IatOutOfRange,
    TpsOutOfRange,
    EctOutOfRange,
}

impl RejectionReport {
    fn record(&mut self, reason: Reject) {
        match reason {
            Reject::MissingRpmOrMap => self.missing_rpm_or_map += 1,
            Reject::MapOutOfRange => self.map_out_of_range += 1,
            Reject::MissingAfr => self.missing_afr += 1,
            Reject::AfrOutOfRange => self.afr_out_of_range += 1,
            Reject::IatOutOfRange => self.iat_out_of_range += 1,
            Reject::TpsOutOfRange => self.tps_out_of_range += 1,
            Reject::EctOutOfRange => self.ect_out_of_range += 1,
        }
    }
}

fn in_range(value: f64, (lo, hi): (f64, f64)) -> bool {
    value >= lo && value <= hi
}

fn passes_optional_filters(sample: &LogSample, filters: &SampleFilterConfig) -> Result<(), Reject> {
    if let Some(range) = filters.iat_range {
        if let Some(iat) = sample.iat {
            if !in_range(iat, range) {
                return Err(Reject::IatOutOfRange);
            }
        }
    }
    if let Some(range) = filters.tps_range {
        if let Some(tps) = sample.tps {
            if !in_range(tps, range) {
                return Err(Reject::TpsOutOfRange);
            }
        }
    }
    if let Some(min) = filters.ect_min {
        if let Some(ect) = sample.ect {
            if ect < min {
                return Err(Reject::EctOutOfRange);
            }
        }
    }
    Ok(())
}

/// Accumulator for one cell, one cylinder. Retains the full set of
/// retained `afr_meas`/`afr_cmd` values so the eventual median is exact;
/// order of insertion does not affect the result.
#[derive(Clone, Debug, Default)]
struct CellAccumulator {
    afr_meas: Vec<f64>,
    afr_cmd: Vec<f64>,
    sum_afr_error: f64,
    sum_abs_afr_error: f64,
    sum_tps: f64,
    tps_count: u64,
    last_timestamp: Option<f64>,
}

/// Finalized per-cell statistics produced by the bin aggregator.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CellStats {
    pub hit_count: u64,
    pub afr_meas_median: f64,
    pub afr_cmd_median: f64,
    pub mean_afr_error: f64,
    pub mean_abs_afr_error: f64,
    pub mean_tps: f64,
    pub last_timestamp: Option<f64>,
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).expect("finite afr is comparable"));
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

impl CellAccumulator {
    fn push(&mut self, afr_cmd: f64, afr_meas: f64, tps: Option<f64>, timestamp: Option<f64>) {
        let afr_error = afr_meas - afr_cmd;
        self.sum_afr_error += afr_error;
        self.sum_abs_afr_error += afr_error.abs();
        self.afr_meas.push(afr_meas);
        self.afr_cmd.push(afr_cmd);
        if let Some(tps) = tps {
            self.sum_tps += tps;
            self.tps_count += 1;
        }
        if timestamp.is_some() {
            self.last_timestamp = timestamp;
        }
    }

    fn finalize(mut self) -> CellStats {
        let hit_count = self.afr_meas.len() as u64;
        if hit_count == 0 {
            return CellStats::default();
        }
        CellStats {
            hit_count,
            afr_meas_median: median(&mut self.afr_meas),
            afr_cmd_median: median(&mut self.afr_cmd),
            mean_afr_error: self.sum_afr_error / hit_count as f64,
            mean_abs_afr_error: self.sum_abs_afr_error / hit_count as f64,
            mean_tps: if self.tps_count > 0 {
                self.sum_tps / self.tps_count as f64
            } else {
                0.0
            },
            last_timestamp: self.last_timestamp,
        }
    }
}

/// Result of folding a log into one cylinder's per-cell statistics.
pub struct AggregateResult {
    /// Dense, row-major (RPM-major) per-cell statistics, one entry per
    /// grid cell; cells with zero hits are the `Default` `CellStats`.
    pub cells: Vec<CellStats>,
    pub rejections: RejectionReport,
}

impl AggregateResult {
    /// Statistics for a specific cell.
    #[must_use]
    pub fn get(&self, cell: Cell, grid: &Grid) -> CellStats {
        self.cells[grid.flat_index(cell)]
    }
}

/// Fold `samples` into per-cell statistics for one cylinder.
///
/// Samples are consumed in the order given (the public API requires
/// callers to pass samples in canonical, typically ascending-timestamp,
/// order); a rejected sample only ever increments a counter, it never
/// aborts the fold.
#[must_use]
pub fn aggregate(samples: &[LogSample], grid: &Grid, cylinder: Cylinder, config: &Config) -> AggregateResult {
    let mut cells = vec![CellAccumulator::default(); grid.n_cells()];
    let mut rejections = RejectionReport::default();

    for sample in samples {
        let (Some(rpm), Some(map_kpa)) = (sample.rpm, sample.map_kpa) else {
            rejections.record(Reject::MissingRpmOrMap);
            continue;
        };
        if !rpm.is_finite() || !map_kpa.is_finite() {
            rejections.record(Reject::MissingRpmOrMap);
            continue;
        }

        let Some((afr_cmd, afr_meas)) = sample.afr_pair(cylinder) else {
            rejections.record(Reject::MissingAfr);
            continue;
        };

        if !in_range(map_kpa, MAP_RANGE) {
            rejections.record(Reject::MapOutOfRange);
            continue;
        }
        if !in_range(afr_meas, AFR_MEAS_RANGE) {
            rejections.record(Reject::AfrOutOfRange);
            continue;
        }

        if let Err(reason) = passes_optional_filters(sample, &config.sample_filters) {
            rejections.record(reason);
            continue;
        }

        let cell = grid.bin_of(rpm, map_kpa);
        let idx = grid.flat_index(cell);
        cells[idx].push(afr_cmd, afr_meas, sample.tps, sample.timestamp);
    }

    let cells = cells.into_iter().map(CellAccumulator::finalize).collect();

    AggregateResult { cells, rejections }
}
