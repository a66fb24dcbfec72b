use crate::csv_table;
use anyhow::{Context, Result};
use dynoai_core::config::Config;
use dynoai_core::kernel::CorrectionArtifact;
use dynoai_core::sample::LogSample;
use dynoai_core::table::{AfrTargetUnit, Table, VeUnit};
use prettytable::format::{FormatBuilder, LinePosition, LineSeparator};
use prettytable::Table as PrettyTable;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::process::ExitCode;

pub fn create_table() -> PrettyTable {
    let mut table = PrettyTable::new();
    table.set_format(
        FormatBuilder::new()
            .column_separator(' ')
            .separator(LinePosition::Title, LineSeparator::new('-', '+', ' ', ' '))
            .build(),
    );
    table
}

/// Map a core error to this process' stable exit-code contract.
pub fn exit_code_for(error: &dynoai_core::error::Error) -> ExitCode {
    use dynoai_core::error::Error;
    match error {
        Error::InvalidInput(_) => ExitCode::from(2),
        Error::SafetyViolation(_) => ExitCode::from(3),
        Error::InvariantViolation(_) | Error::Io { .. } => ExitCode::from(4),
        Error::Cancelled => ExitCode::from(130),
        Error::TimedOut => ExitCode::from(124),
    }
}

/// Print a core error to stderr in the CLI's `ERROR [<kind>]: <message>`
/// form and return its corresponding exit code.
pub fn report_core_error(error: &dynoai_core::error::Error) -> ExitCode {
    eprintln!("ERROR [{}]: {error}", error.kind());
    exit_code_for(error)
}

/// Hard ceiling recognized from `DYNOAI_MAX_CLAMP_PCT`; an additive check on
/// top of the core's own fixed ceiling. Rejects before the core ever sees
/// the config if the caller asked for a ceiling lower than the one
/// `Config::validate` enforces internally.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let file = File::open(path).context(format!("unable to open '{}'", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .context(format!("unable to parse '{}' as config JSON", path.display()))?
        }
        None => Config::default(),
    };

    if let Ok(raw) = std::env::var("DYNOAI_MAX_CLAMP_PCT") {
        let ceiling: f64 = raw.parse().context("DYNOAI_MAX_CLAMP_PCT is not a valid number")?;
        if config.clamp_pct > ceiling {
            config.clamp_pct = ceiling;
        }
    }

    config.validate().context("config failed validation")?;
    Ok(config)
}

/// Reject an artifact whose `math_version` does not match
/// `DYNOAI_MATH_VERSION_PIN`, when that env var is set.
pub fn check_math_version_pin(artifact: &CorrectionArtifact) -> Result<()> {
    if let Ok(pin) = std::env::var("DYNOAI_MATH_VERSION_PIN") {
        if artifact.math_version != pin {
            return Err(anyhow::anyhow!(
                "artifact math_version '{}' does not match DYNOAI_MATH_VERSION_PIN '{pin}'",
                artifact.math_version
            ));
        }
    }
    Ok(())
}

pub fn load_samples(path: &Path) -> Result<Vec<LogSample>> {
    let file = File::open(path).context(format!("unable to open '{}'", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .context(format!("unable to parse '{}' as a log sample array", path.display()))
}

pub fn load_ve_table(path: &Path) -> Result<Table<VeUnit>> {
    csv_table::read_table_csv(path)
}

pub fn write_ve_table(path: &Path, table: &Table<VeUnit>) -> Result<()> {
    csv_table::write_table_csv(path, table)
}

pub fn load_afr_target_table(path: &Path) -> Result<Table<AfrTargetUnit>> {
    csv_table::read_table_csv(path)
}

pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(path).context(format!("unable to create '{}'", path.display()))?;
    serde_json::to_writer_pretty(file, value).context(format!("unable to write '{}'", path.display()))
}

pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).context(format!("unable to open '{}'", path.display()))?;
    serde_json::from_reader(BufReader::new(file)).context(format!("unable to parse '{}' as JSON", path.display()))
}
