//! Dense, unit-tagged 2-D tables over a [`Grid`](crate::grid::Grid).
//!
//! Tables are type-tagged by unit so mixing is impossible: a small newtype
//! wrapping `Vec<f64>` expresses "this numeric array means one specific
//! physical thing", carried one step further with a zero-sized phantom
//! unit parameter so the compiler — not a runtime tag — prevents a VE
//! table from being passed where a factor table is expected.

use crate::error::{Error, Result};
use crate::grid::Grid;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// A unit a [`Table`] can be tagged with. Sealed: only the units defined in
/// this module implement it.
pub trait Unit: sealed::Sealed {
    /// Human-readable name used in error messages.
    const NAME: &'static str;
    /// Inclusive valid range for a cell of this unit, if bounded.
    fn valid_range() -> Option<(f64, f64)>;
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! unit {
    ($name:ident, $label:literal, $range:expr) => {
        /// Unit marker, see [`Unit`].
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name;
        impl sealed::Sealed for $name {}
        impl Unit for $name {
            const NAME: &'static str = $label;
            fn valid_range() -> Option<(f64, f64)> {
                $range
            }
        }
    };
}

unit!(VeUnit, "volumetric efficiency", Some((0.3, 1.5)));
unit!(FactorUnit, "correction factor percentage", None);
unit!(AfrTargetUnit, "AFR target", Some((9.0, 18.0)));
unit!(WeightUnit, "coverage weight", Some((0.0, 1.0)));

/// A dense 2-D table of `f64` cells over a [`Grid`], tagged by physical
/// unit `U` so distinct tables cannot be confused at compile time.
#[derive(Clone, Debug, Serialize)]
pub struct Table<U> {
    grid: Grid,
    cells: Vec<f64>,
    #[serde(skip)]
    _unit: PhantomData<U>,
}

/// Wire shape for [`Table`]; deserializing through this and then
/// [`Table::new`] re-runs the same dimension/range validation a caller
/// gets from constructing a table directly, so a hand-edited or
/// adversarial JSON file can't smuggle an out-of-range cell past the
/// file-loading boundary.
#[derive(Deserialize)]
struct TableWire {
    grid: Grid,
    cells: Vec<f64>,
}

impl<'de, U: Unit> Deserialize<'de> for Table<U> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = TableWire::deserialize(deserializer)?;
        Self::new(wire.grid, wire.cells).map_err(serde::de::Error::custom)
    }
}

impl<U: Unit> Table<U> {
    /// Build a table from a row-major (RPM-major) dense cell vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `cells.len() != grid.n_cells()`,
    /// or if any cell is non-finite, or if `U` has a bounded valid range
    /// and a cell falls outside it.
    pub fn new(grid: Grid, cells: Vec<f64>) -> Result<Self> {
        if cells.len() != grid.n_cells() {
            return Err(Error::InvalidInput(format!(
                "{} table has {} cells, grid expects {}",
                U::NAME,
                cells.len(),
                grid.n_cells()
            )));
        }
        for &v in &cells {
            if !v.is_finite() {
                return Err(Error::InvalidInput(format!(
                    "{} table contains a non-finite cell",
                    U::NAME
                )));
            }
            if let Some((lo, hi)) = U::valid_range() {
                if v < lo || v > hi {
                    return Err(Error::InvalidInput(format!(
                        "{} cell {v} outside valid range [{lo}, {hi}]",
                        U::NAME
                    )));
                }
            }
        }
        Ok(Self {
            grid,
            cells,
            _unit: PhantomData,
        })
    }

    /// Build a table of a single repeated value.
    ///
    /// # Errors
    ///
    /// As [`Table::new`].
    pub fn filled(grid: Grid, value: f64) -> Result<Self> {
        let n = grid.n_cells();
        Self::new(grid, vec![value; n])
    }

    /// The underlying grid.
    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Read a cell by `(i, j)` index.
    #[must_use]
    pub fn get(&self, cell: (usize, usize)) -> f64 {
        self.cells[self.grid.flat_index(cell)]
    }

    /// Row-major dense cell slice.
    #[must_use]
    pub fn cells(&self) -> &[f64] {
        &self.cells
    }

    /// Bilinear-interpolated value at an arbitrary operating point,
    /// clamped to the grid edges (delegates to [`Grid::interpolate`]).
    #[must_use]
    pub fn interpolate(&self, rpm: f64, map_kpa: f64) -> f64 {
        self.grid.interpolate(&self.cells, rpm, map_kpa)
    }

    /// Build a new table of the same grid by applying `f` to every cell,
    /// re-validating the result against `U`'s constraints.
    ///
    /// # Errors
    ///
    /// As [`Table::new`], applied to the transformed cells.
    pub fn map(&self, mut f: impl FnMut((usize, usize), f64) -> f64) -> Result<Self> {
        let n_map = self.grid.n_map();
        let cells = self
            .cells
            .iter()
            .enumerate()
            .map(|(idx, &v)| f((idx / n_map, idx % n_map), v))
            .collect();
        Self::new(self.grid.clone(), cells)
    }
}

/// Non-negative integer hit-count table; deliberately not `Table<U>` since
/// its cells are integral, not a physical float quantity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HitCountTable {
    grid: Grid,
    cells: Vec<u64>,
}

impl HitCountTable {
    /// Build a hit-count table from a row-major dense cell vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `cells.len() != grid.n_cells()`.
    pub fn new(grid: Grid, cells: Vec<u64>) -> Result<Self> {
        if cells.len() != grid.n_cells() {
            return Err(Error::InvalidInput(format!(
                "hit-count table has {} cells, grid expects {}",
                cells.len(),
                grid.n_cells()
            )));
        }
        Ok(Self { grid, cells })
    }

    /// The underlying grid.
    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Read a cell by `(i, j)` index.
    #[must_use]
    pub fn get(&self, cell: (usize, usize)) -> u64 {
        self.cells[self.grid.flat_index(cell)]
    }

    /// Row-major dense cell slice.
    #[must_use]
    pub fn cells(&self) -> &[u64] {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        Grid::new(vec![1000.0, 2000.0], vec![20.0, 40.0]).unwrap()
    }

    #[test]
    fn rejects_dimension_mismatch() {
        assert!(Table::<VeUnit>::new(grid(), vec![0.8, 0.8, 0.8]).is_err());
    }

    #[test]
    fn rejects_non_finite() {
        assert!(Table::<VeUnit>::new(grid(), vec![0.8, 0.8, 0.8, f64::NAN]).is_err());
    }

    #[test]
    fn rejects_out_of_range_for_bounded_unit() {
        assert!(Table::<VeUnit>::new(grid(), vec![0.1, 0.8, 0.8, 0.8]).is_err());
        assert!(Table::<FactorUnit>::new(grid(), vec![-500.0, 0.8, 0.8, 0.8]).is_ok());
    }

    #[test]
    fn deserialize_rejects_out_of_range_cell() {
        let json = r#"{"grid":{"rpm_bins":[1000.0,2000.0],"map_bins":[20.0,40.0]},"cells":[0.1,0.8,0.8,0.8]}"#;
        let result: Result<Table<VeUnit>> = serde_json::from_str(json).map_err(|e| crate::error::Error::InvalidInput(e.to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn deserialize_then_serialize_roundtrips() {
        let t = Table::<VeUnit>::filled(grid(), 0.85).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: Table<VeUnit> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cells(), t.cells());
    }

    #[test]
    fn filled_and_get_roundtrip() {
        let t = Table::<VeUnit>::filled(grid(), 0.85).unwrap();
        assert_eq!(t.get((0, 0)), 0.85);
        assert_eq!(t.get((1, 1)), 0.85);
    }

    #[test]
    fn map_preserves_grid_and_transforms_cells() {
        let t = Table::<VeUnit>::filled(grid(), 0.8).unwrap();
        let doubled = t.map(|_cell, v| (v * 1.1).min(1.4)).unwrap();
        assert!((doubled.get((0, 0)) - 0.88).abs() < 1e-9);
    }
}
