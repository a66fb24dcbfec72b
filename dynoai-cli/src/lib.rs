#![allow(clippy::missing_errors_doc)]
#![allow(missing_docs)]

mod analyze;
mod apply;
mod csv_table;
mod helpers;
mod rollback;
mod tune;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Options shared by every subcommand.
#[derive(Parser)]
pub struct GlobalConfiguration {
    /// Emit machine-readable JSON instead of a text table.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Root directory for run artifacts.
    #[arg(long, env = "DYNOAI_RUNS_DIR", default_value = "./runs", value_name = "DIR")]
    pub runs_dir: PathBuf,
    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

pub trait Subcommand {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode>;
}

#[derive(Parser)]
pub enum SubcommandEnum {
    /// Bin a dyno log against a base VE table and run the correction kernel.
    Analyze(analyze::Opts),
    /// Apply a correction artifact to a base VE table.
    Apply(apply::Opts),
    /// Roll back a previously applied correction.
    Rollback(rollback::Opts),
    /// Run a closed-loop virtual-ECU tuning session.
    Tune(tune::Opts),
}

impl Subcommand for SubcommandEnum {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        match self {
            Self::Analyze(opts) => opts.run(cfg),
            Self::Apply(opts) => opts.run(cfg),
            Self::Rollback(opts) => opts.run(cfg),
            Self::Tune(opts) => opts.run(cfg),
        }
    }
}

#[derive(Parser)]
#[command(
    arg_required_else_help = true,
    author,
    about,
    disable_help_subcommand = true,
    name = "dynoai",
    version
)]
pub struct Opts {
    #[command(flatten)]
    pub configuration: GlobalConfiguration,
    #[command(subcommand)]
    pub subcommand: SubcommandEnum,
}
