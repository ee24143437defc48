use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;

use furrow_core::models::{QueueItem, Record, SyncConflict};
use furrow_core::sync::resolver;
use furrow_core::util::normalize_text_option;
use furrow_core::{HttpRemoteStore, SyncConfig, SyncEngine, SyncReport, SyncStore};
use serde_json::Value;

use crate::error::CliError;

pub const DEFAULT_SCOPE: &str = "default";

/// Everything a command needs to open the local store.
pub struct Context {
    pub db_path: PathBuf,
    pub scope: String,
    pub config: SyncConfig,
}

impl Context {
    pub async fn open_store(&self) -> Result<SyncStore, CliError> {
        Ok(SyncStore::open_path(&self.db_path, self.config.clone()).await?)
    }

    pub async fn open_engine(&self) -> Result<SyncEngine<HttpRemoteStore>, CliError> {
        let store = self.open_store().await?;
        self.engine_for(store)
    }

    pub fn engine_for(&self, store: SyncStore) -> Result<SyncEngine<HttpRemoteStore>, CliError> {
        if !self.config.has_remote() {
            return Err(CliError::RemoteNotConfigured);
        }
        let remote = HttpRemoteStore::from_config(&self.config)?;
        Ok(SyncEngine::new(store, remote))
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("FURROW_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("furrow")
        .join("furrow.db")
}

pub fn resolve_scope(cli_scope: Option<String>) -> String {
    normalize_text_option(cli_scope)
        .or_else(|| normalize_text_option(env::var("FURROW_SCOPE").ok()))
        .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
}

pub fn parse_record(raw: &str, flag: &'static str) -> Result<Record, CliError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(record) => Ok(record),
        _ => Err(CliError::InvalidJson {
            flag,
            expected: "a JSON object",
        }),
    }
}

pub fn parse_records(raw: &str, flag: &'static str) -> Result<Vec<Record>, CliError> {
    let invalid = || CliError::InvalidJson {
        flag,
        expected: "a JSON array of objects",
    };

    match serde_json::from_str::<Value>(raw)? {
        Value::Array(values) => values
            .into_iter()
            .map(|value| match value {
                Value::Object(record) => Ok(record),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn format_queue_lines(items: &[QueueItem], now_ms: i64) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let target = item
                .mutation
                .entity_keys()
                .first()
                .map_or_else(|| item.mutation.table().to_string(), ToString::to_string);
            let mut line = format!(
                "{:<28}  {:<21}  {:<13}  {:<24}  {}",
                item.id,
                item.status,
                item.mutation.kind(),
                target,
                format_relative_time(item.created_at, now_ms)
            );
            if let Some(error) = &item.last_error {
                let kind = item
                    .failure_kind
                    .map_or_else(String::new, |kind| format!("{kind}: "));
                line.push_str(&format!("\n    retries={} {kind}{error}", item.retry_count));
            }
            line
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[SyncConflict], ignored: &BTreeSet<String>) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let fields = resolver::diff_fields(&conflict.client_data, &conflict.server_data, ignored)
                .into_iter()
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "{}  {}/{}  fields: {}  item: {}  detected {}",
                conflict.id,
                conflict.table_name,
                conflict.record_id,
                fields,
                conflict.queue_item_id,
                format_sync_timestamp(conflict.created_at)
            )
        })
        .collect()
}

pub fn format_report(report: &SyncReport) -> String {
    if let Some(reason) = report.skipped {
        return format!("Sync skipped ({reason})");
    }

    let mut summary = format!(
        "Sync finished: {} processed, {} completed, {} failed, {} conflicted",
        report.processed, report.completed, report.failed, report.conflicted
    );
    if report.deferred > 0 {
        summary.push_str(&format!(", {} deferred", report.deferred));
    }
    if report.resolutions_applied > 0 {
        summary.push_str(&format!(
            ", {} resolution(s) applied",
            report.resolutions_applied
        ));
    }
    if report.aborted {
        summary.push_str(" (aborted)");
    }
    summary
}
