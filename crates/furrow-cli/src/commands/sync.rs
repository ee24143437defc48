use crate::commands::common::{format_report, Context};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let engine = ctx.open_engine().await?;
    let report = engine.sync().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", format_report(&report));
    }
    Ok(())
}
