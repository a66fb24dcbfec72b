use super::helpers;
use super::{GlobalConfiguration, OutputFormat, Subcommand};
use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use dynoai_core::sample::Cylinder;
use dynoai_core::store::ArtifactStore;
use prettytable::row;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bin a dyno log against base VE tables and run the correction kernel for
/// both cylinder banks.
#[derive(Parser)]
pub struct Opts {
    /// Path to a JSON array of log samples.
    #[arg(long, value_hint = ValueHint::FilePath)]
    log: PathBuf,
    /// Path to the front bank's base VE table (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    base_front: PathBuf,
    /// Path to the rear bank's base VE table (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    base_rear: PathBuf,
    /// Run directory to write artifacts into; defaults to a generated
    /// directory under `--runs-dir`.
    #[arg(long, value_hint = ValueHint::DirPath)]
    out: Option<PathBuf>,
    /// Maximum absolute percentage delta a cell may carry after clamping.
    #[arg(long)]
    clamp_pct: Option<f64>,
    /// Number of gradient-limited smoothing passes.
    #[arg(long)]
    smooth_passes: Option<u32>,
    /// Semver tag embedded in every correction artifact.
    #[arg(long)]
    math_version: Option<String>,
    /// Compute and print the result without writing any artifact.
    #[arg(long)]
    dry_run: bool,
}

fn generate_run_id() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    format!("run-{nanos}")
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let samples = helpers::load_samples(&self.log)?;
        let base_front = helpers::load_ve_table(&self.base_front)?;
        let base_rear = helpers::load_ve_table(&self.base_rear)?;
        if base_front.grid() != base_rear.grid() {
            eprintln!("ERROR [InvalidInput]: front and rear base VE tables have different grids");
            return Ok(ExitCode::from(2));
        }

        let mut config = helpers::load_config(None)?;
        if let Some(clamp_pct) = self.clamp_pct {
            config.clamp_pct = clamp_pct;
        }
        if let Some(smooth_passes) = self.smooth_passes {
            config.smooth_passes = smooth_passes;
        }
        if let Some(math_version) = &self.math_version {
            config.math_version = math_version.clone();
        }
        config.validate().context("config failed validation")?;

        let grid = base_front.grid().clone();

        let front = match dynoai_core::analyze(&samples, &grid, Cylinder::Front, &base_front, &config) {
            Ok(result) => result,
            Err(e) => return Ok(helpers::report_core_error(&e)),
        };
        let rear = match dynoai_core::analyze(&samples, &grid, Cylinder::Rear, &base_rear, &config) {
            Ok(result) => result,
            Err(e) => return Ok(helpers::report_core_error(&e)),
        };

        if !self.dry_run {
            let run_dir = self.out.clone().unwrap_or_else(|| cfg.runs_dir.join(generate_run_id()));
            let store = ArtifactStore::open(&run_dir)?;

            let input_dir = run_dir.join("input");
            std::fs::create_dir_all(&input_dir).context(format!("unable to create '{}'", input_dir.display()))?;
            std::fs::copy(&self.base_front, input_dir.join("base_front.csv"))
                .context("unable to snapshot base front VE table")?;
            std::fs::copy(&self.base_rear, input_dir.join("base_rear.csv"))
                .context("unable to snapshot base rear VE table")?;
            std::fs::copy(&self.log, input_dir.join("log.json")).context("unable to snapshot log")?;

            store.write("factors_front.json", &front.artifact)?;
            store.write("factors_rear.json", &rear.artifact)?;
            store.write(
                "diagnostics.json",
                &serde_json::json!({"front": front.diagnostics, "rear": rear.diagnostics}),
            )?;

            println!("wrote run '{}'", run_dir.display());
        }

        if cfg.format == OutputFormat::Json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "front": {"coverage_pct": front.diagnostics.coverage_pct, "rejected": front.rejections.total()},
                    "rear": {"coverage_pct": rear.diagnostics.coverage_pct, "rejected": rear.rejections.total()},
                }))?
            );
        } else {
            let mut table = helpers::create_table();
            table.set_titles(row![c => "metric", "front", "rear"]);
            table.add_row(row![
                "coverage %",
                format!("{:.1}", front.diagnostics.coverage_pct),
                format!("{:.1}", rear.diagnostics.coverage_pct)
            ]);
            table.add_row(row![
                "MAD afr error",
                format!("{:.3}", front.diagnostics.mad_afr_error),
                format!("{:.3}", rear.diagnostics.mad_afr_error)
            ]);
            table.add_row(row![
                "clamp fraction",
                format!("{:.3}", front.diagnostics.clamp_fraction),
                format!("{:.3}", rear.diagnostics.clamp_fraction)
            ]);
            table.add_row(row![
                "confidence grade",
                front.diagnostics.confidence_grade.to_string(),
                rear.diagnostics.confidence_grade.to_string()
            ]);
            table.add_row(row![
                "clamped cells",
                front.artifact.clamped_count().to_string(),
                rear.artifact.clamped_count().to_string()
            ]);
            table.add_row(row![
                "anomalies",
                front.diagnostics.anomalies.len().to_string(),
                rear.diagnostics.anomalies.len().to_string()
            ]);
            table.add_row(row![
                "rejected samples",
                front.rejections.total().to_string(),
                rear.rejections.total().to_string()
            ]);
            table.printstd();

            for anomaly in front.diagnostics.anomalies.iter().chain(&rear.diagnostics.anomalies) {
                println!("  - {anomaly:?}");
            }
        }

        Ok(ExitCode::SUCCESS)
    }
}
