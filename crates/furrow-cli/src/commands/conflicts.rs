use furrow_core::ConflictResolution;

use crate::cli::ResolveStrategy;
use crate::commands::common::{format_conflict_lines, parse_record, Context};
use crate::error::CliError;

pub async fn run_conflicts_list(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let conflicts = ctx
        .open_store()
        .await?
        .unresolved_conflicts(&ctx.scope)
        .await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No unresolved conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts, &ctx.config.ignored_fields) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflict_resolve(
    id: &str,
    strategy: ResolveStrategy,
    data: Option<&str>,
    ctx: &Context,
) -> Result<(), CliError> {
    let strategy = ConflictResolution::from(strategy);
    let resolved_data = data
        .map(|raw| parse_record(raw, "--data"))
        .transpose()?;

    let store = ctx.open_store().await?;
    if !store.resolve_conflict(id, strategy, resolved_data).await? {
        return Err(CliError::ConflictNotResolvable(id.to_string()));
    }

    if !ctx.config.has_remote() {
        println!("Resolved {id} ({strategy}); it is applied on the next sync");
        return Ok(());
    }

    let engine = ctx.engine_for(store)?;
    match engine.apply_conflict_resolution(id).await? {
        Some(item) => println!("Resolved {id} ({strategy}); {} completed", item.id),
        None => println!("Resolved {id} ({strategy})"),
    }
    Ok(())
}

pub async fn run_conflict_merge(id: &str, ctx: &Context) -> Result<(), CliError> {
    let engine = ctx.open_engine().await?;
    match engine.merge_conflict(id).await? {
        Some(item) => println!("Merged {id}; {} completed", item.id),
        None => println!("Merged {id}"),
    }
    Ok(())
}
