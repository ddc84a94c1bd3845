//! CLI command handlers.

mod inspect;
mod pipeline;

use std::time::Duration;

use anyhow::{Context, Result};
use prefetch_core::{PrefetchConfig, PrefetchStore};

use crate::cli::Command;

pub use inspect::{run_list_command, run_metrics_command, run_quota_command, run_status_command};
pub use pipeline::{
    run_add_command, run_maintain_command, run_notify_command, run_remove_command,
    run_remove_unprocessed_command, run_service_command,
};

/// Dispatches one parsed subcommand.
pub async fn run_command(command: Command, config: &PrefetchConfig, wait: Duration) -> Result<()> {
    match command {
        Command::Add(args) => run_add_command(config, &args, wait).await,
        Command::RemoveUnprocessed { namespace } => {
            run_remove_unprocessed_command(config, &namespace, wait).await
        }
        Command::Remove { namespace, id } => run_remove_command(config, namespace, id, wait).await,
        Command::Notify { operation } => run_notify_command(config, &operation, wait).await,
        Command::Maintain => run_maintain_command(config, wait).await,
        Command::Run => run_service_command(config).await,
        Command::Status(output) => run_status_command(config, output.json).await,
        Command::List { state, output } => run_list_command(config, state, output.json).await,
        Command::Quota => run_quota_command(config).await,
        Command::Metrics => run_metrics_command(config).await,
    }
}

/// Opens the configured store and waits for its schema to be ready.
async fn open_store(config: &PrefetchConfig) -> Result<PrefetchStore> {
    let store = PrefetchStore::open(config.store_options());
    store
        .wait_for_initialization()
        .await
        .with_context(|| format!("failed to open store at {}", config.database_path.display()))?;
    Ok(store)
}
