#![allow(missing_docs)]

use clap::Parser;
use dynoai_cli::{Opts, Subcommand};
use log::LevelFilter;
use std::process::{ExitCode, Termination};

fn level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    env_logger::Builder::new()
        .filter_level(level_for(opts.configuration.verbose))
        .init();

    match opts.subcommand.run(&opts.configuration) {
        Ok(code) => code,
        result @ Err(_) => result.report(),
    }
}
