use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use dynoai_core::apply::ApplyMetadata;
use dynoai_core::kernel::CorrectionArtifact;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

/// Apply a correction artifact to a base VE table.
#[derive(Parser)]
pub struct Opts {
    /// Path to the base VE table (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    base: PathBuf,
    /// Path to the correction artifact produced by `analyze` (JSON).
    #[arg(long, value_hint = ValueHint::FilePath)]
    factor: PathBuf,
    /// Path to write the updated VE table (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: PathBuf,
    /// Override the artifact's own clamp percentage for the
    /// clamp-exceeded safety check.
    #[arg(long)]
    max_adjust_pct: Option<f64>,
    /// Expected SHA-256 of the base VE table; rejects if it does not match.
    #[arg(long, value_name = "HEX")]
    expect_base_hash: Option<String>,
    /// Path to the apply metadata from a prior apply on this same lineage;
    /// its `cumulative` record is chained into this apply's cumulative cap
    /// check. Omit for the first apply on a fresh base table.
    #[arg(long, value_hint = ValueHint::FilePath)]
    previous_metadata: Option<PathBuf>,
    /// Compute the result without writing it anywhere.
    #[arg(long)]
    dry_run: bool,
    /// Path to write the apply metadata (hashes, cumulative record);
    /// defaults to `<output>` with an added `.metadata.json` extension.
    #[arg(long, value_hint = ValueHint::FilePath)]
    metadata_out: Option<PathBuf>,
}

impl Subcommand for Opts {
    fn run(&self, _cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let base_ve = helpers::load_ve_table(&self.base)?;
        let mut config = helpers::load_config(None)?;
        if let Some(max_adjust_pct) = self.max_adjust_pct {
            config.clamp_pct = max_adjust_pct;
        }
        config.validate().context("config failed validation")?;

        let file = File::open(&self.factor).context(format!("unable to open '{}'", self.factor.display()))?;
        let artifact: CorrectionArtifact = serde_json::from_reader(BufReader::new(file))
            .context(format!("unable to parse '{}' as a correction artifact", self.factor.display()))?;

        helpers::check_math_version_pin(&artifact)?;

        let previous_metadata: Option<ApplyMetadata> = self
            .previous_metadata
            .as_deref()
            .map(helpers::load_json)
            .transpose()?;
        let previous_cumulative = previous_metadata.as_ref().map(|m| m.cumulative.as_slice());

        let (updated, metadata) = match dynoai_core::apply_correction(
            &base_ve,
            &artifact,
            self.expect_base_hash.as_deref(),
            previous_cumulative,
            self.dry_run,
            &config,
        ) {
            Ok(result) => result,
            Err(e) => return Ok(helpers::report_core_error(&e)),
        };

        if !self.dry_run {
            helpers::write_ve_table(&self.output, &updated)?;
            let metadata_path = self
                .metadata_out
                .clone()
                .unwrap_or_else(|| self.output.with_extension("metadata.json"));
            helpers::write_json(&metadata_path, &metadata)?;
        }

        println!(
            "base {} -> updated {} ({} cells clamped at source){}",
            &metadata.base_ve_hash[..12],
            &metadata.updated_ve_hash[..12],
            artifact.clamped_count(),
            if self.dry_run { " [dry run]" } else { "" }
        );

        Ok(ExitCode::SUCCESS)
    }
}
