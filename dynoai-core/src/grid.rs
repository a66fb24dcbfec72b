//! Grid Model (C1): fixed RPM x MAP binning, bin lookup, interpolation
//! primitives.
//!
//! Bin lookup is a binary search over each sorted axis; interpolation
//! separates "find the surrounding nodes" from "combine them" into two
//! axis-independent bilinear passes with edge clamping — extrapolation
//! beyond the grid's bounds is never allowed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when an axis fails the "strictly increasing, at least two
/// entries" precondition every [`Grid`] axis must satisfy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("axis is not strictly increasing or has fewer than two entries")]
pub struct InvalidAxis;

/// Immutable RPM x MAP grid shared read-only by all downstream data for a
/// given analysis.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Grid {
    rpm_bins: Vec<f64>,
    map_bins: Vec<f64>,
}

/// A cell identified by its integer axis indices.
pub type Cell = (usize, usize);

fn validate_axis(axis: &[f64]) -> Result<(), InvalidAxis> {
    if axis.len() < 2 {
        return Err(InvalidAxis);
    }
    if axis.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(InvalidAxis);
    }
    Ok(())
}

/// Locate `value` in a strictly increasing `axis`, returning the index of
/// the nearest node. A value exactly on a bin boundary snaps to the lower
/// index.
fn nearest_bin(axis: &[f64], value: f64) -> usize {
    // `partition_point` finds the first index where `axis[i] >= value`,
    // giving us the node immediately at-or-above `value` in O(log n).
    let upper = axis.partition_point(|&x| x < value);

    if upper == 0 {
        return 0;
    }
    if upper == axis.len() {
        return axis.len() - 1;
    }

    let lower = upper - 1;
    let dist_lower = (value - axis[lower]).abs();
    let dist_upper = (axis[upper] - value).abs();

    if dist_upper < dist_lower {
        upper
    } else {
        lower
    }
}

/// The two bracketing indices and interpolation fraction `t` in `[0, 1]`
/// for `value` on `axis`, clamped to the edges outside the axis range.
fn bracket(axis: &[f64], value: f64) -> (usize, usize, f64) {
    let n = axis.len();
    if value <= axis[0] {
        return (0, 0, 0.0);
    }
    if value >= axis[n - 1] {
        return (n - 1, n - 1, 0.0);
    }

    let upper = axis.partition_point(|&x| x < value).max(1).min(n - 1);
    let lower = upper - 1;
    let t = (value - axis[lower]) / (axis[upper] - axis[lower]);

    (lower, upper, t)
}

impl Grid {
    /// Build a grid from RPM and MAP axes.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidAxis`] if either axis is not strictly increasing or
    /// has fewer than two entries.
    pub fn new(rpm_bins: Vec<f64>, map_bins: Vec<f64>) -> Result<Self, InvalidAxis> {
        validate_axis(&rpm_bins)?;
        validate_axis(&map_bins)?;
        Ok(Self {
            rpm_bins,
            map_bins,
        })
    }

    /// RPM axis, strictly increasing.
    #[must_use]
    pub fn rpm_bins(&self) -> &[f64] {
        &self.rpm_bins
    }

    /// MAP axis (kPa), strictly increasing.
    #[must_use]
    pub fn map_bins(&self) -> &[f64] {
        &self.map_bins
    }

    /// Number of RPM bins.
    #[must_use]
    pub fn n_rpm(&self) -> usize {
        self.rpm_bins.len()
    }

    /// Number of MAP bins.
    #[must_use]
    pub fn n_map(&self) -> usize {
        self.map_bins.len()
    }

    /// Total number of cells.
    #[must_use]
    pub fn n_cells(&self) -> usize {
        self.n_rpm() * self.n_map()
    }

    /// Snap a sample into the cell whose center is nearest on each axis.
    #[must_use]
    pub fn bin_of(&self, rpm: f64, map_kpa: f64) -> Cell {
        (
            nearest_bin(&self.rpm_bins, rpm),
            nearest_bin(&self.map_bins, map_kpa),
        )
    }

    /// Flatten a `(i, j)` cell into a row-major index, RPM-major.
    #[must_use]
    pub fn flat_index(&self, (i, j): Cell) -> usize {
        i * self.n_map() + j
    }

    /// Up to eight in-grid neighbors of a cell (no wraparound).
    #[must_use]
    pub fn neighbors(&self, (i, j): Cell) -> Vec<Cell> {
        let mut out = Vec::with_capacity(8);
        for di in -1i64..=1 {
            for dj in -1i64..=1 {
                if di == 0 && dj == 0 {
                    continue;
                }
                let ni = i as i64 + di;
                let nj = j as i64 + dj;
                if ni >= 0 && nj >= 0 && (ni as usize) < self.n_rpm() && (nj as usize) < self.n_map()
                {
                    out.push((ni as usize, nj as usize));
                }
            }
        }
        out
    }

    /// Bilinear interpolation of `values` (a row-major, RPM-major dense
    /// grid of `n_rpm * n_map` cells) at `(rpm, map_kpa)`. Points outside
    /// the grid are clamped to the nearest edge; no extrapolation.
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != self.n_cells()` — this is a programmer
    /// error (mismatched table), not a recoverable input error.
    #[must_use]
    pub fn interpolate(&self, values: &[f64], rpm: f64, map_kpa: f64) -> f64 {
        assert_eq!(values.len(), self.n_cells(), "table/grid dimension mismatch");

        let (ri0, ri1, rt) = bracket(&self.rpm_bins, rpm);
        let (mj0, mj1, mt) = bracket(&self.map_bins, map_kpa);

        let at = |i: usize, j: usize| values[i * self.n_map() + j];

        let v00 = at(ri0, mj0);
        let v01 = at(ri0, mj1);
        let v10 = at(ri1, mj0);
        let v11 = at(ri1, mj1);

        let v0 = v00 + (v01 - v00) * mt;
        let v1 = v10 + (v11 - v10) * mt;

        v0 + (v1 - v0) * rt
    }
}
