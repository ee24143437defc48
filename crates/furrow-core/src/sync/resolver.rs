//! Conflict detection and resolution policies.
//!
//! Everything here is a pure function of its inputs. The merge is last-writer
//! wins per field; there is no attempt to merge concurrent edits inside a
//! single field value.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde_json::Value;

use crate::models::{record_id, EntityKey, FieldStamps, Mutation, Record};
use crate::util::timestamp_from_value;

/// Column the remote store stamps on every write
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// A disagreement found while comparing a mutation with the server's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub entity: EntityKey,
    pub client: Record,
    pub server: Record,
    pub client_stamps: FieldStamps,
    pub server_stamps: FieldStamps,
    /// Fields whose values differ, ignored fields excluded
    pub fields: BTreeSet<String>,
}

/// Fields present in either snapshot whose values are not deep-equal.
pub fn diff_fields(client: &Record, server: &Record, ignored: &BTreeSet<String>) -> BTreeSet<String> {
    client
        .keys()
        .chain(server.keys())
        .filter(|field| !ignored.contains(*field))
        .filter(|field| client.get(*field) != server.get(*field))
        .cloned()
        .collect()
}

/// Compare every client snapshot of `mutation` with the matching server row.
///
/// Updates carrying no base only compare the fields the client wrote, since
/// nothing else was assumed. Records the server did not echo are skipped.
pub fn detect(
    mutation: &Mutation,
    created_at: i64,
    server_rows: &[Record],
    ignored: &BTreeSet<String>,
) -> Vec<DetectedConflict> {
    let partial = mutation.base_snapshot().is_some_and(Record::is_empty);

    mutation
        .client_snapshots()
        .into_iter()
        .filter_map(|(entity, client)| {
            let server = server_rows
                .iter()
                .find(|row| record_id(row) == Some(entity.id.as_str()))?;

            let mut fields = diff_fields(&client, server, ignored);
            if partial {
                fields.retain(|field| client.contains_key(field));
            }
            if fields.is_empty() {
                return None;
            }

            let (client_stamps, server_stamps) = derive_stamps(mutation, created_at, server);
            Some(DetectedConflict {
                entity,
                client,
                server: server.clone(),
                client_stamps,
                server_stamps,
                fields,
            })
        })
        .collect()
}

/// Per-field update stamps for both sides of a conflict.
///
/// Fields the mutation wrote carry the item's `created_at`. Server fields
/// that moved away from the client's base carry the server row's
/// `updated_at`, and are always strictly newer than the base. Everything
/// else keeps the base's own `updated_at` (or 0).
pub fn derive_stamps(mutation: &Mutation, created_at: i64, server: &Record) -> (FieldStamps, FieldStamps) {
    let base = mutation.base_snapshot();
    let base_stamp = base
        .and_then(|base| base.get(UPDATED_AT_FIELD))
        .and_then(timestamp_from_value)
        .unwrap_or(0);
    let moved_stamp = base_stamp.saturating_add(1);
    let server_stamp = server
        .get(UPDATED_AT_FIELD)
        .and_then(timestamp_from_value)
        .map_or(moved_stamp, |stamp| stamp.max(moved_stamp));

    let client_stamps = match mutation.changed_fields() {
        Some(changed) => changed
            .into_iter()
            .fold(FieldStamps::uniform(base_stamp), |stamps, field| {
                stamps.with_field(field, created_at)
            }),
        None => FieldStamps::uniform(created_at),
    };

    let server_stamps = match base {
        Some(base) => server
            .iter()
            .filter(|(field, value)| base.get(*field) != Some(*value))
            .fold(FieldStamps::uniform(base_stamp), |stamps, (field, _)| {
                stamps.with_field(field.clone(), server_stamp)
            }),
        None => FieldStamps::uniform(server_stamp),
    };

    (client_stamps, server_stamps)
}

/// Per-field last-writer-wins merge.
///
/// For each differing field the side with the newer stamp wins. Equal stamps
/// fall back to a canonical ordering of the values, so swapping the two
/// sides (with their stamps) yields the same record. A field missing on the
/// winning side keeps the other side's value.
pub fn merge(
    client: &Record,
    server: &Record,
    client_stamps: &FieldStamps,
    server_stamps: &FieldStamps,
) -> Record {
    let mut merged = Record::new();

    for field in client.keys().chain(server.keys()) {
        if merged.contains_key(field) {
            continue;
        }

        let value = match (client.get(field), server.get(field)) {
            (Some(ours), Some(theirs)) if ours == theirs => ours,
            (Some(ours), None) => ours,
            (None, Some(theirs)) => theirs,
            (Some(ours), Some(theirs)) => {
                match client_stamps
                    .stamp(field)
                    .cmp(&server_stamps.stamp(field))
                    .then_with(|| canonical_cmp(ours, theirs))
                {
                    Ordering::Less => theirs,
                    Ordering::Greater | Ordering::Equal => ours,
                }
            }
            (None, None) => continue,
        };
        merged.insert(field.clone(), value.clone());
    }

    merged
}

/// Total order over JSON values by their serialized form.
fn canonical_cmp(left: &Value, right: &Value) -> Ordering {
    left.to_string().cmp(&right.to_string())
}

/// The changes an authoritative resolution writes over `server`.
///
/// Carries every field of `resolved` except server-owned ones, and clears
/// (`null`) each server field the resolved record does not have.
pub fn authoritative_changes(
    resolved: &Record,
    server: &Record,
    ignored: &BTreeSet<String>,
) -> Record {
    let cleared = server
        .keys()
        .filter(|field| !resolved.contains_key(*field))
        .map(|field| (field, Value::Null));

    resolved
        .iter()
        .map(|(field, value)| (field, value.clone()))
        .chain(cleared)
        .filter(|(field, _)| !ignored.contains(*field))
        .map(|(field, value)| (field.clone(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_IGNORED_FIELDS;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn ignored() -> BTreeSet<String> {
        DEFAULT_IGNORED_FIELDS.iter().map(|f| (*f).to_string()).collect()
    }

    #[test]
    fn diff_ignores_server_owned_fields() {
        let client = record(json!({"id": "e-1", "amount": 100, "farm_id": "a"}));
        let server = record(json!({"id": "e-1", "amount": 100, "farm_id": "b", "updated_at": 5}));
        assert!(diff_fields(&client, &server, &ignored()).is_empty());

        let server = record(json!({"id": "e-1", "amount": 100, "notes": "late"}));
        assert_eq!(
            diff_fields(&client, &server, &ignored()),
            BTreeSet::from(["notes".to_string()])
        );
    }

    #[test]
    fn detect_reports_base_disagreement() {
        let mutation = Mutation::RecordUpdate {
            table: "expenses".into(),
            id: "e-1".into(),
            base: record(json!({"id": "e-1", "amount": 50, "category": "Other", "updated_at": 1})),
            changes: record(json!({"amount": 100})),
        };
        let server = record(json!({"id": "e-1", "amount": 100, "category": "Feed", "updated_at": 7}));

        let conflicts = detect(&mutation, 5, &[server], &ignored());
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.fields, BTreeSet::from(["category".to_string()]));
        assert_eq!(conflict.client["category"], json!("Other"));
        assert_eq!(conflict.server["category"], json!("Feed"));

        assert_eq!(conflict.client_stamps.stamp("amount"), 5);
        assert_eq!(conflict.client_stamps.stamp("category"), 1);
        assert_eq!(conflict.server_stamps.stamp("category"), 7);
    }

    #[test]
    fn detect_without_base_compares_written_fields_only() {
        let mutation = Mutation::RecordUpdate {
            table: "expenses".into(),
            id: "e-1".into(),
            base: Record::new(),
            changes: record(json!({"amount": 100})),
        };
        let server = record(json!({"id": "e-1", "amount": 100, "category": "Feed"}));
        assert!(detect(&mutation, 5, &[server], &ignored()).is_empty());
    }

    #[test]
    fn detect_skips_deletes_and_unechoed_rows() {
        let delete = Mutation::RecordDelete {
            table: "expenses".into(),
            id: "e-1".into(),
        };
        assert!(detect(&delete, 5, &[], &ignored()).is_empty());

        let bulk = Mutation::BulkInsert {
            table: "harvests".into(),
            records: vec![
                record(json!({"id": "h-1", "kg": 10})),
                record(json!({"id": "h-2", "kg": 12})),
            ],
        };
        let rows = vec![record(json!({"id": "h-2", "kg": 99}))];
        let conflicts = detect(&bulk, 5, &rows, &ignored());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entity, EntityKey::new("harvests", "h-2"));
    }

    #[test]
    fn merge_keeps_newer_field_from_each_side() {
        let client = record(json!({"id": "e-1", "amount": 50, "notes": "client note"}));
        let server = record(json!({"id": "e-1", "amount": 75, "notes": "old note"}));
        let client_stamps = FieldStamps::uniform(0).with_field("notes", 10);
        let server_stamps = FieldStamps::uniform(0).with_field("amount", 20);

        let merged = merge(&client, &server, &client_stamps, &server_stamps);
        assert_eq!(
            Value::Object(merged),
            json!({"id": "e-1", "amount": 75, "notes": "client note"})
        );
    }

    #[test]
    fn merge_is_deterministic_and_symmetric() {
        let a = record(json!({"amount": 1, "notes": "a", "tag": "x", "only_a": true}));
        let b = record(json!({"amount": 2, "notes": "b", "tag": "y", "only_b": 3}));
        let ta = FieldStamps::uniform(5).with_field("amount", 9);
        let tb = FieldStamps::uniform(5).with_field("notes", 9);

        let first = merge(&a, &b, &ta, &tb);
        assert_eq!(first, merge(&a, &b, &ta, &tb));
        assert_eq!(first, merge(&b, &a, &tb, &ta));

        assert_eq!(first["amount"], json!(1));
        assert_eq!(first["notes"], json!("b"));
        // Tie on `tag`: canonical ordering picks "y" from either side
        assert_eq!(first["tag"], json!("y"));
        assert_eq!(first["only_a"], json!(true));
        assert_eq!(first["only_b"], json!(3));
    }

    #[test]
    fn merge_is_idempotent() {
        let client = record(json!({"amount": 1, "notes": "a"}));
        let server = record(json!({"amount": 2, "notes": "b"}));
        let stamps = FieldStamps::uniform(1);
        let merged = merge(&client, &server, &stamps, &stamps);

        assert_eq!(merge(&merged, &merged, &stamps, &stamps), merged);
    }

    #[test]
    fn unstamped_server_edit_beats_stale_base_value() {
        let mutation = Mutation::RecordUpdate {
            table: "expenses".into(),
            id: "e-1".into(),
            base: record(json!({"id": "e-1", "amount": 50, "category": "Other"})),
            changes: record(json!({"amount": 100})),
        };
        let server = record(json!({"id": "e-1", "amount": 100, "category": "Feed"}));

        let conflicts = detect(&mutation, 5, &[server], &ignored());
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert!(conflict.server_stamps.stamp("category") > conflict.client_stamps.stamp("category"));

        let merged = merge(
            &conflict.client,
            &conflict.server,
            &conflict.client_stamps,
            &conflict.server_stamps,
        );
        assert_eq!(merged["category"], json!("Feed"));
        assert_eq!(merged["amount"], json!(100));
    }

    #[test]
    fn server_stamp_older_than_base_still_counts_as_newer() {
        let mutation = Mutation::RecordUpdate {
            table: "expenses".into(),
            id: "e-1".into(),
            base: record(json!({"id": "e-1", "category": "Other", "updated_at": 9})),
            changes: record(json!({"amount": 100})),
        };
        let server = record(json!({"id": "e-1", "category": "Feed", "updated_at": 3}));

        let (client_stamps, server_stamps) = derive_stamps(&mutation, 20, &server);
        assert_eq!(client_stamps.stamp("category"), 9);
        assert_eq!(server_stamps.stamp("category"), 10);
        assert_eq!(client_stamps.stamp("amount"), 20);
    }

    #[test]
    fn authoritative_changes_drop_ignored_and_clear_server_only_fields() {
        let client = record(json!({"id": "e-1", "amount": 1, "updated_at": 3}));
        let server = record(json!({"id": "e-1", "amount": 2, "notes": "server only", "updated_at": 8}));
        assert_eq!(
            Value::Object(authoritative_changes(&client, &server, &ignored())),
            json!({"amount": 1, "notes": null})
        );
    }
}
