use furrow_core::{Mutation, QueueItemInput};

use crate::cli::EnqueueCommands;
use crate::commands::common::{parse_record, parse_records, Context};
use crate::error::CliError;

pub async fn run_enqueue(command: EnqueueCommands, ctx: &Context) -> Result<(), CliError> {
    let input = build_input(command, &ctx.scope)?;
    let item = ctx.open_store().await?.enqueue(input).await?;

    println!("{}", item.id);
    Ok(())
}

pub fn build_input(command: EnqueueCommands, scope: &str) -> Result<QueueItemInput, CliError> {
    let (mutation, optimistic_id) = match command {
        EnqueueCommands::Create {
            table,
            id,
            data,
            optimistic_id,
        } => (
            Mutation::RecordCreate {
                table,
                id,
                record: parse_record(&data, "--data")?,
            },
            optimistic_id,
        ),
        EnqueueCommands::Update {
            table,
            id,
            changes,
            base,
            optimistic_id,
        } => (
            Mutation::RecordUpdate {
                table,
                id,
                base: base
                    .as_deref()
                    .map(|raw| parse_record(raw, "--base"))
                    .transpose()?
                    .unwrap_or_default(),
                changes: parse_record(&changes, "--changes")?,
            },
            optimistic_id,
        ),
        EnqueueCommands::Delete {
            table,
            id,
            optimistic_id,
        } => (Mutation::RecordDelete { table, id }, optimistic_id),
        EnqueueCommands::Bulk {
            table,
            records,
            optimistic_id,
        } => (
            Mutation::BulkInsert {
                table,
                records: parse_records(&records, "--records")?,
            },
            optimistic_id,
        ),
    };

    let input = QueueItemInput::new(scope, mutation);
    Ok(match optimistic_id {
        Some(optimistic_id) => input.with_optimistic_id(optimistic_id),
        None => input,
    })
}
