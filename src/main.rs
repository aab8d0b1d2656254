#![allow(clippy::too_many_arguments)]

mod cli;

use std::process::ExitCode;

use clap::Parser;
use erasefe::logger;

fn main() -> ExitCode {
    // Initialize session log (overwrites previous session log)
    logger::init();

    let args = cli::CliArgs::parse();
    let code = cli::run(args);
    erasefe::log_info!("Exiting ({:?})", code);
    code
}
