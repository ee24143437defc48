use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use furrow_core::models::{FieldStamps, QueueStatus, SyncConflict};
use furrow_core::sync::SkipReason;
use furrow_core::{Mutation, SyncConfig, SyncReport};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::cli::EnqueueCommands;
use crate::commands::common::{
    format_conflict_lines, format_relative_time, format_report, parse_record, parse_records,
    resolve_scope, Context,
};
use crate::commands::enqueue::{build_input, run_enqueue};
use crate::commands::queue::{run_discard, run_retry};
use crate::commands::sync::run_sync;
use crate::error::CliError;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_test_db_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "furrow-cli-test-{}-{nanos}-{counter}.db",
        std::process::id()
    ))
}

fn test_context() -> Context {
    Context {
        db_path: unique_test_db_path(),
        scope: "farm-1".to_string(),
        config: SyncConfig::default(),
    }
}

#[test]
fn parse_record_requires_object() {
    assert_eq!(
        parse_record(r#"{"amount": 100}"#, "--data").unwrap()["amount"],
        json!(100)
    );
    assert!(matches!(
        parse_record("[1, 2]", "--data"),
        Err(CliError::InvalidJson { flag: "--data", .. })
    ));
    assert!(matches!(
        parse_record("not json", "--data"),
        Err(CliError::Serialization(_))
    ));
}

#[test]
fn parse_records_rejects_non_objects() {
    let records = parse_records(r#"[{"id": "h-1"}, {"id": "h-2"}]"#, "--records").unwrap();
    assert_eq!(records.len(), 2);
    assert!(parse_records(r#"[{"id": "h-1"}, 3]"#, "--records").is_err());
    assert!(parse_records(r#"{"id": "h-1"}"#, "--records").is_err());
}

#[test]
fn build_input_maps_update_arguments() {
    let input = build_input(
        EnqueueCommands::Update {
            table: "expenses".into(),
            id: "e-1".into(),
            changes: r#"{"amount": 100}"#.into(),
            base: None,
            optimistic_id: Some("opt-1".into()),
        },
        "farm-1",
    )
    .unwrap();

    assert_eq!(input.scope_id, "farm-1");
    assert_eq!(input.optimistic_id.as_deref(), Some("opt-1"));
    match input.mutation {
        Mutation::RecordUpdate { base, changes, .. } => {
            assert!(base.is_empty());
            assert_eq!(changes["amount"], json!(100));
        }
        other => panic!("unexpected mutation {other:?}"),
    }
}

#[test]
fn explicit_scope_wins_and_blank_falls_back() {
    assert_eq!(resolve_scope(Some("farm-9".into())), "farm-9");
    assert!(!resolve_scope(Some("   ".into())).trim().is_empty());
}

#[test]
fn relative_time_buckets() {
    let now = 10 * 24 * 60 * 60 * 1000;
    assert_eq!(format_relative_time(now - 5_000, now), "just now");
    assert_eq!(format_relative_time(now - 5 * 60_000, now), "5m ago");
    assert_eq!(format_relative_time(now - 3 * 60 * 60_000, now), "3h ago");
    assert_eq!(format_relative_time(0, now), "10d ago");
}

#[test]
fn report_summary_mentions_skips_and_deferrals() {
    let skipped = SyncReport {
        skipped: Some(SkipReason::Offline),
        ..SyncReport::default()
    };
    assert_eq!(format_report(&skipped), "Sync skipped (offline)");

    let report = SyncReport {
        processed: 3,
        completed: 2,
        failed: 1,
        deferred: 1,
        ..SyncReport::default()
    };
    assert_eq!(
        format_report(&report),
        "Sync finished: 3 processed, 2 completed, 1 failed, 0 conflicted, 1 deferred"
    );
}

#[test]
fn conflict_lines_list_differing_fields() {
    let conflict = SyncConflict {
        id: "c-1".into(),
        queue_item_id: "q-1".into(),
        scope_id: "farm-1".into(),
        table_name: "expenses".into(),
        record_id: "e-1".into(),
        client_data: json!({"id": "e-1", "category": "Other", "updated_at": 1})
            .as_object()
            .cloned()
            .unwrap(),
        server_data: json!({"id": "e-1", "category": "Feed", "updated_at": 7})
            .as_object()
            .cloned()
            .unwrap(),
        client_stamps: FieldStamps::default(),
        server_stamps: FieldStamps::default(),
        created_at: 0,
        resolution: None,
        resolved_data: None,
        resolved_at: None,
        applied_at: None,
    };

    let lines = format_conflict_lines(&[conflict], &SyncConfig::default().ignored_fields);
    assert_eq!(
        lines,
        vec!["c-1  expenses/e-1  fields: category  item: q-1  detected 1970-01-01 00:00:00 UTC"]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn enqueue_persists_pending_item() {
    let ctx = test_context();
    run_enqueue(
        EnqueueCommands::Create {
            table: "expenses".into(),
            id: "e-1".into(),
            data: r#"{"amount": 100}"#.into(),
            optimistic_id: None,
        },
        &ctx,
    )
    .await
    .unwrap();

    let items = ctx.open_store().await.unwrap().list_all().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Pending);
    assert_eq!(items[0].scope_id, "farm-1");
}

#[tokio::test(flavor = "current_thread")]
async fn retry_and_discard_need_failed_items() {
    let ctx = test_context();
    let item = ctx
        .open_store()
        .await
        .unwrap()
        .enqueue(
            build_input(
                EnqueueCommands::Delete {
                    table: "expenses".into(),
                    id: "e-1".into(),
                    optimistic_id: None,
                },
                &ctx.scope,
            )
            .unwrap(),
        )
        .await
        .unwrap();

    assert!(run_retry(&item.id, &ctx).await.is_err());
    assert!(run_discard(&item.id, &ctx).await.is_err());
}

#[tokio::test(flavor = "current_thread")]
async fn sync_requires_remote_configuration() {
    let ctx = test_context();
    assert!(matches!(
        run_sync(false, &ctx).await,
        Err(CliError::RemoteNotConfigured)
    ));
}
