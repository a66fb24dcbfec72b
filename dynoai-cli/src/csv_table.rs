//! CSV codec for [`Table`] values. Base VE / updated VE / factor tables
//! are stored as CSV with `RPM` as the first column header and MAP bin
//! values as the remaining column headers.
//!
//! Deliberately not inside `dynoai-core`: the core does no CSV parsing,
//! and the grid this format implies is a fixed rectangular layout simple
//! enough that a dependency buys nothing a few lines of `split`/`join`
//! doesn't already give.

use anyhow::{anyhow, Context, Result};
use dynoai_core::grid::Grid;
use dynoai_core::store::sanitize_csv_cell;
use dynoai_core::table::{Table, Unit};
use std::fs;
use std::path::Path;

pub fn read_table_csv<U: Unit>(path: &Path) -> Result<Table<U>> {
    let text = fs::read_to_string(path).context(format!("unable to open '{}'", path.display()))?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header = lines.next().ok_or_else(|| anyhow!("'{}' is empty", path.display()))?;
    let mut header_cells = header.split(',');
    let first = header_cells.next().unwrap_or_default();
    if first.trim() != "RPM" {
        return Err(anyhow!("'{}': expected header column 'RPM', found '{first}'", path.display()));
    }
    let map_bins: Vec<f64> = header_cells
        .map(|c| c.trim().parse::<f64>().context(format!("'{}': invalid MAP header value '{c}'", path.display())))
        .collect::<Result<_>>()?;

    let mut rpm_bins = Vec::new();
    let mut cells = Vec::new();
    for line in lines {
        let mut row = line.split(',');
        let rpm: f64 = row
            .next()
            .ok_or_else(|| anyhow!("'{}': row missing RPM value", path.display()))?
            .trim()
            .parse()
            .context(format!("'{}': invalid RPM row value", path.display()))?;
        rpm_bins.push(rpm);
        for cell in row {
            let value: f64 = cell.trim().parse().context(format!("'{}': invalid cell value '{cell}'", path.display()))?;
            cells.push(value);
        }
    }

    let grid = Grid::new(rpm_bins, map_bins).map_err(|e| anyhow!("'{}': {e}", path.display()))?;
    Table::<U>::new(grid, cells).map_err(|e| anyhow!("'{}': {e}", path.display()))
}

pub fn write_table_csv<U: Unit>(path: &Path, table: &Table<U>) -> Result<()> {
    let grid = table.grid();
    let mut out = String::new();

    out.push_str("RPM");
    for &map in grid.map_bins() {
        out.push(',');
        out.push_str(&sanitize_csv_cell(&format!("{map}")));
    }
    out.push('\n');

    for (i, &rpm) in grid.rpm_bins().iter().enumerate() {
        out.push_str(&sanitize_csv_cell(&format!("{rpm}")));
        for j in 0..grid.n_map() {
            out.push(',');
            out.push_str(&sanitize_csv_cell(&format!("{:.4}", table.get((i, j)))));
        }
        out.push('\n');
    }

    fs::write(path, out).context(format!("unable to write '{}'", path.display()))?;
    Ok(())
}
