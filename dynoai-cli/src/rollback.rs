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

/// Roll back a previously applied correction.
#[derive(Parser)]
pub struct Opts {
    /// Path to the current (updated) VE table (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    current: PathBuf,
    /// Path to the apply metadata recorded by that apply (JSON).
    #[arg(long, value_hint = ValueHint::FilePath)]
    metadata: PathBuf,
    /// Path to the correction artifact used for the original apply (JSON).
    /// Needed to invert the per-cell delta; `metadata` alone only carries
    /// hashes, not the factor itself.
    #[arg(long, value_hint = ValueHint::FilePath)]
    factor: PathBuf,
    /// Path to write the restored VE table (CSV).
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let file = File::open(path).context(format!("unable to open '{}'", path.display()))?;
    serde_json::from_reader(BufReader::new(file)).context(format!("unable to parse '{}'", path.display()))
}

impl Subcommand for Opts {
    fn run(&self, _cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let current_ve = helpers::load_ve_table(&self.current)?;
        let artifact: CorrectionArtifact = load_json(&self.factor)?;
        let metadata: ApplyMetadata = load_json(&self.metadata)?;

        let restored = match dynoai_core::rollback(&current_ve, &artifact, &metadata) {
            Ok(restored) => restored,
            Err(e) => return Ok(helpers::report_core_error(&e)),
        };

        helpers::write_ve_table(&self.output, &restored)?;

        println!("restored base VE table, hash {}", &metadata.base_ve_hash[..12]);
        Ok(ExitCode::SUCCESS)
    }
}
