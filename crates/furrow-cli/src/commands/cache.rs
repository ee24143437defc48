use furrow_core::CacheKey;

use crate::commands::common::{format_sync_timestamp, Context};
use crate::error::CliError;

pub async fn run_checkpoints(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let checkpoints = ctx.open_store().await?.all_checkpoints(&ctx.scope).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        return Ok(());
    }

    if checkpoints.is_empty() {
        println!("No tables synced yet.");
        return Ok(());
    }
    for checkpoint in checkpoints {
        println!(
            "{:<20}  {}  {} record(s)",
            checkpoint.table_name,
            format_sync_timestamp(checkpoint.last_sync_at),
            checkpoint.records_synced
        );
    }
    Ok(())
}

pub async fn run_cache_stats(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let stats = ctx.open_store().await?.cache_stats(&ctx.scope).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "{} entries: {} fresh, {} stale, {} optimistic",
        stats.entries, stats.fresh, stats.stale, stats.optimistic
    );
    for collection in &stats.collections {
        let updated = collection
            .last_updated
            .map_or_else(|| "-".to_string(), format_sync_timestamp);
        println!(
            "  {:<20} {:>5} entries  {:>5} fresh  {:>5} optimistic  updated {}",
            collection.collection,
            collection.entries,
            collection.fresh,
            collection.optimistic,
            updated
        );
    }
    Ok(())
}

pub async fn run_cache_invalidate(
    collection: &str,
    id: Option<&str>,
    ctx: &Context,
) -> Result<(), CliError> {
    let key = match id {
        Some(id) => CacheKey::record(&ctx.scope, collection, id),
        None => CacheKey::collection(&ctx.scope, collection),
    };
    let removed = ctx.open_store().await?.cache_invalidate(&key).await?;
    println!("Invalidated {removed} entr{} for {key}", if removed == 1 { "y" } else { "ies" });
    Ok(())
}
