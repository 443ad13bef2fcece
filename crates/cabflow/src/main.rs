//! cabflow - Main entry point

use cabflow::cli::{self, Cli};
use cabflow_common::logging::{init_logging, LogConfig};
use clap::Parser;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Environment variables take precedence over the defaults
    let log_config = cli::log_config(LogConfig::from_env().unwrap_or_default(), cli.verbose);

    // Keep the guard alive so file logs are flushed on exit
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        },
    };

    if let Err(e) = cli::execute(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
