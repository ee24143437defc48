use furrow_core::models::{QueueCounts, SyncCheckpoint};
use furrow_core::util::now_ms;
use serde::Serialize;

use crate::commands::common::{format_queue_lines, format_sync_timestamp, Context};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub scope: String,
    pub queue: QueueCounts,
    pub unresolved_conflicts: usize,
    pub checkpoints: Vec<SyncCheckpoint>,
}

pub async fn run_status(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let store = ctx.open_store().await?;
    let summary = StatusSummary {
        scope: ctx.scope.clone(),
        queue: store.count_by_status().await?,
        unresolved_conflicts: store.conflict_count(&ctx.scope).await?,
        checkpoints: store.all_checkpoints(&ctx.scope).await?,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let queue = summary.queue;
    println!(
        "Queue: {} pending, {} processing, {} awaiting confirmation, {} failed, {} completed",
        queue.pending, queue.processing, queue.awaiting_confirmation, queue.failed, queue.completed
    );
    println!(
        "Unresolved conflicts in {}: {}",
        summary.scope, summary.unresolved_conflicts
    );
    for checkpoint in &summary.checkpoints {
        println!(
            "  {:<20} last sync {}  ({} records)",
            checkpoint.table_name,
            format_sync_timestamp(checkpoint.last_sync_at),
            checkpoint.records_synced
        );
    }
    Ok(())
}

pub async fn run_queue(failed_only: bool, as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let store = ctx.open_store().await?;
    let items = if failed_only {
        store.all_failed().await?
    } else {
        store.list_all().await?
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for line in format_queue_lines(&items, now_ms()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_retry(id: &str, ctx: &Context) -> Result<(), CliError> {
    let item = ctx.open_store().await?.retry(id).await?;
    println!("{} is {}", item.id, item.status);
    Ok(())
}

pub async fn run_discard(id: &str, ctx: &Context) -> Result<(), CliError> {
    ctx.open_store().await?.discard(id).await?;
    println!("Discarded {id}");
    Ok(())
}

pub async fn run_purge(all: bool, ctx: &Context) -> Result<(), CliError> {
    let store = ctx.open_store().await?;
    let purged = if all {
        store.purge_completed_before(i64::MAX).await?
    } else {
        store.purge_completed().await?
    };
    println!("Purged {purged} completed item(s)");
    Ok(())
}
