//! EACache CLI - Command-line interface
//!
//! Drives the eacache library against the in-process engine: submit fetches
//! in each mode, watch timeouts and cancellation, and print cache statistics.

mod commands;
mod error;
mod logging;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use commands::cancel::CancelArgs;
use commands::fetch::FetchArgs;

#[derive(Debug, Parser)]
#[command(name = "eacache")]
#[command(version, about = "Energy-adaptive prefetch cache", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit fetches and wait for their results
    Fetch(FetchArgs),
    /// Submit a fetch that never finishes and cancel it
    Cancel(CancelArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let result = match cli.command {
        Commands::Fetch(args) => commands::fetch::run(args),
        Commands::Cancel(args) => commands::cancel::run(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
