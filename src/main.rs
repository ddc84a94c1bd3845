//! CLI entry point for the offline prefetch pipeline.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use prefetch_core::PrefetchConfig;
use tracing::debug;

mod cli;
mod commands;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let mut config =
        PrefetchConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    config.validate().context("invalid configuration")?;
    debug!(
        database = %config.database_path.display(),
        service = %config.service_url,
        "configuration resolved"
    );

    commands::run_command(cli.command, &config, Duration::from_secs(cli.wait)).await
}
