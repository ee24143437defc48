//! Furrow CLI - queue, inspect, and sync offline record changes
//!
//! A thin shell over `furrow-core` for field laptops and diagnostics.

mod cli;
mod commands;
mod error;

use clap::Parser;
use furrow_core::SyncConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::{CacheCommands, Cli, Commands, ConflictCommands};
use crate::commands::cache::{run_cache_invalidate, run_cache_stats, run_checkpoints};
use crate::commands::common::{resolve_db_path, resolve_scope, Context};
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{run_conflict_merge, run_conflict_resolve, run_conflicts_list};
use crate::commands::enqueue::run_enqueue;
use crate::commands::queue::{run_discard, run_purge, run_queue, run_retry, run_status};
use crate::commands::sync::run_sync;
use crate::error::CliError;

const DEFAULT_LOG_FILTER: &str = "furrow_core=info,furrow_cli=info";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context {
        db_path: resolve_db_path(cli.db_path),
        scope: resolve_scope(cli.scope),
        config: SyncConfig::from_env()?,
    };

    match cli.command {
        Commands::Enqueue { command } => run_enqueue(command, &ctx).await?,
        Commands::Status { json } => run_status(json, &ctx).await?,
        Commands::Queue { failed, json } => run_queue(failed, json, &ctx).await?,
        Commands::Sync { json } => run_sync(json, &ctx).await?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { json } => run_conflicts_list(json, &ctx).await?,
            ConflictCommands::Resolve { id, strategy, data } => {
                run_conflict_resolve(&id, strategy, data.as_deref(), &ctx).await?;
            }
            ConflictCommands::Merge { id } => run_conflict_merge(&id, &ctx).await?,
        },
        Commands::Checkpoints { json } => run_checkpoints(json, &ctx).await?,
        Commands::Cache { command } => match command {
            CacheCommands::Stats { json } => run_cache_stats(json, &ctx).await?,
            CacheCommands::Invalidate { collection, id } => {
                run_cache_invalidate(&collection, id.as_deref(), &ctx).await?;
            }
        },
        Commands::Retry { id } => run_retry(&id, &ctx).await?,
        Commands::Discard { id } => run_discard(&id, &ctx).await?,
        Commands::Purge { all } => run_purge(all, &ctx).await?,
        Commands::Completions { shell } => run_completions(shell),
    }

    Ok(())
}

#[cfg(test)]
mod tests;
