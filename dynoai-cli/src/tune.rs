use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use dynoai_core::orchestrator::{self, SessionInputs};
use dynoai_core::table::{Table, VeUnit};
use dynoai_core::virtual_ecu::{CylinderModel, VirtualEcu};
use prettytable::row;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// `ve_actual / ve_ecu` ratio used for the canned `lean` scenario (base VE
/// 0.85, `ve_actual` 0.95).
const LEAN_RATIO: f64 = 0.95 / 0.85;
/// Inverse of [`LEAN_RATIO`], used for the canned `rich` scenario.
const RICH_RATIO: f64 = 0.85 / 0.95;

/// Which virtual-ECU ground-truth scenario to simulate against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// `ve_actual == ve_ecu`; converges immediately.
    Perfect,
    /// `ve_actual` uniformly higher than `ve_ecu` (ECU under-fuels, lean
    /// reading).
    Lean,
    /// `ve_actual` uniformly lower than `ve_ecu` (ECU over-fuels, rich
    /// reading).
    Rich,
    /// `ve_actual` loaded from `--ve-actual-front`/`--ve-actual-rear`.
    Custom,
}

/// Run a closed-loop virtual-ECU tuning session: simulate, correct, and
/// apply in a loop until AFR error converges or a budget is exhausted.
#[derive(Parser)]
pub struct Opts {
    /// Path to the ECU's starting VE table, front bank (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    base_front: PathBuf,
    /// Path to the ECU's starting VE table, rear bank (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    base_rear: PathBuf,
    /// Path to the AFR target table, shared by both banks (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    afr_target: PathBuf,
    /// Which ground-truth scenario to simulate.
    #[arg(long, value_enum)]
    scenario: Scenario,
    /// Ground-truth VE table, front bank; required when `--scenario custom`.
    #[arg(long, value_hint = ValueHint::FilePath)]
    ve_actual_front: Option<PathBuf>,
    /// Ground-truth VE table, rear bank; required when `--scenario custom`.
    #[arg(long, value_hint = ValueHint::FilePath)]
    ve_actual_rear: Option<PathBuf>,
    /// Maximum closed-loop iterations.
    #[arg(long, default_value_t = 10)]
    max_iter: u32,
    /// Convergence threshold on `max_afr_error`.
    #[arg(long, default_value_t = 0.3)]
    threshold: f64,
    /// Seed for the virtual ECU's deterministic noise generator.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Repetitions of the full grid sweep per iteration.
    #[arg(long, default_value_t = 20)]
    sweep_reps: usize,
    /// Standard deviation of simulated AFR sensor noise.
    #[arg(long, default_value_t = 0.05)]
    noise_std_afr: f64,
    /// Simulated intake-air temperature, Kelvin.
    #[arg(long, default_value_t = 298.0)]
    iat_k: f64,
    /// Simulated throttle position, percent.
    #[arg(long, default_value_t = 60.0)]
    tps: f64,
    /// Write the final tuned VE tables here (`<path>.front.csv` /
    /// `<path>.rear.csv`).
    #[arg(long, value_hint = ValueHint::FilePath)]
    out_prefix: Option<PathBuf>,
}

fn scaled(table: &Table<VeUnit>, ratio: f64) -> Result<Table<VeUnit>> {
    Ok(table.map(|_cell, v| (v * ratio).clamp(0.3, 1.5))?)
}

impl Opts {
    fn ve_actual(&self, ve_ecu_front: &Table<VeUnit>, ve_ecu_rear: &Table<VeUnit>) -> Result<(Table<VeUnit>, Table<VeUnit>)> {
        match self.scenario {
            Scenario::Perfect => Ok((ve_ecu_front.clone(), ve_ecu_rear.clone())),
            Scenario::Lean => Ok((scaled(ve_ecu_front, LEAN_RATIO)?, scaled(ve_ecu_rear, LEAN_RATIO)?)),
            Scenario::Rich => Ok((scaled(ve_ecu_front, RICH_RATIO)?, scaled(ve_ecu_rear, RICH_RATIO)?)),
            Scenario::Custom => {
                let front = self
                    .ve_actual_front
                    .as_deref()
                    .context("--ve-actual-front is required with --scenario custom")?;
                let rear = self
                    .ve_actual_rear
                    .as_deref()
                    .context("--ve-actual-rear is required with --scenario custom")?;
                Ok((helpers::load_ve_table(front)?, helpers::load_ve_table(rear)?))
            }
        }
    }
}

impl Subcommand for Opts {
    fn run(&self, _cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let ve_ecu_front = helpers::load_ve_table(&self.base_front)?;
        let ve_ecu_rear = helpers::load_ve_table(&self.base_rear)?;
        let afr_target = helpers::load_afr_target_table(&self.afr_target)?;
        let (ve_actual_front, ve_actual_rear) = self.ve_actual(&ve_ecu_front, &ve_ecu_rear)?;

        let mut config = helpers::load_config(None)?;
        config.max_iterations = self.max_iter;
        config.convergence_threshold_afr = self.threshold;
        config.seed = self.seed;
        config.validate().context("config failed validation")?;

        let grid = ve_ecu_front.grid().clone();

        let front = CylinderModel {
            ve_actual: ve_actual_front,
            ve_ecu: ve_ecu_front.clone(),
            afr_target: afr_target.clone(),
        };
        let rear = CylinderModel {
            ve_actual: ve_actual_rear,
            ve_ecu: ve_ecu_rear.clone(),
            afr_target,
        };
        let virtual_ecu = VirtualEcu::new(front, rear, self.noise_std_afr, config.seed);

        let mut sweep_points = Vec::new();
        for _ in 0..self.sweep_reps {
            for &rpm in grid.rpm_bins() {
                for &map_kpa in grid.map_bins() {
                    sweep_points.push((rpm, map_kpa));
                }
            }
        }

        let inputs = SessionInputs {
            grid,
            ve_ecu_front,
            ve_ecu_rear,
            virtual_ecu,
            sweep_points,
            iat_k: self.iat_k,
            tps: self.tps,
            config,
        };

        let id = match orchestrator::run_closed_loop(inputs, Arc::new(AtomicBool::new(false))) {
            Ok(id) => id,
            Err(e) => return Ok(helpers::report_core_error(&e)),
        };

        let session = orchestrator::get_session(id).expect("session was just registered");

        let mut table = helpers::create_table();
        table.set_titles(row![c =>
            "iteration",
            "max afr err front", "max afr err rear",
            "mean afr err front", "mean afr err rear",
            "max delta front", "max delta rear",
            "clamp% front", "clamp% rear"
        ]);
        for record in &session.iterations {
            table.add_row(row![
                record.iteration.to_string(),
                format!("{:.3}", record.max_afr_error_front),
                format!("{:.3}", record.max_afr_error_rear),
                format!("{:.3}", record.mean_afr_error_front),
                format!("{:.3}", record.mean_afr_error_rear),
                format!("{:.2}", record.max_delta_front),
                format!("{:.2}", record.max_delta_rear),
                format!("{:.1}", 100.0 * record.clamp_fraction_front),
                format!("{:.1}", 100.0 * record.clamp_fraction_rear),
            ]);
        }
        table.printstd();

        println!("session {id}: {:?}", session.status);
        if let Some(reason) = &session.failure_reason {
            println!("reason: {reason}");
        }

        if let Some(prefix) = &self.out_prefix {
            if let Some(ve_front) = &session.final_ve_front {
                helpers::write_ve_table(&prefix.with_extension("front.csv"), ve_front)?;
            }
            if let Some(ve_rear) = &session.final_ve_rear {
                helpers::write_ve_table(&prefix.with_extension("rear.csv"), ve_rear)?;
            }
        }

        Ok(match session.status {
            orchestrator::SessionStatus::Converged => ExitCode::SUCCESS,
            orchestrator::SessionStatus::TimedOut => ExitCode::from(124),
            orchestrator::SessionStatus::Aborted => ExitCode::from(130),
            _ => ExitCode::from(3),
        })
    }
}
