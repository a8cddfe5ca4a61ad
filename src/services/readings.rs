use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{insert_rows, list_rows, update_rows_where};
use crate::schemas::{remove_nulls, serialize_to_map, ReadingInput};
use crate::services::amounts::val_f64;

/// Result of one bulk upsert call. `Conflict` still reports the rows that
/// were inserted: genuinely-new readings persist even when updates are
/// refused, so a first submission populates new connections and an explicit
/// re-submission with `allow_update` overwrites the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Applied { inserted: usize, updated: usize },
    Conflict { inserted: usize, existing_count: usize },
}

/// Classification of the incoming rows against what the store already holds
/// for the date.
#[derive(Debug, Default)]
pub struct ReadingPartition {
    pub to_insert: Vec<ReadingInput>,
    pub to_update: Vec<ReadingInput>,
    /// Rows that already exist for the date, changed or not. This is the
    /// count a conflict reports.
    pub existing_count: usize,
    pub unchanged: usize,
}

/// Reconcile one day of submeter readings.
///
/// One read fetches the existing rows for exactly the incoming connection
/// ids; the diff decides what gets written. Inserts go in a single statement
/// (per-date batches are bounded by the active submeter-connection count, so
/// they stay small — unlike batch membership, which is chunked). Updates are
/// applied row by row against the (connection, date) key; the first failing
/// row aborts with the count applied so far.
pub async fn upsert_bulk(
    pool: &PgPool,
    reading_date: NaiveDate,
    readings: &[ReadingInput],
    allow_update: bool,
    actor: &str,
) -> AppResult<UpsertOutcome> {
    let deduped = dedup_by_connection(readings);
    if deduped.is_empty() {
        return Ok(UpsertOutcome::Applied {
            inserted: 0,
            updated: 0,
        });
    }
    let date_iso = reading_date.to_string();

    let connection_ids: Vec<Value> = deduped
        .iter()
        .map(|reading| Value::String(reading.connection_id.clone()))
        .collect();
    let mut filters = Map::new();
    filters.insert("reading_date".to_string(), Value::String(date_iso.clone()));
    filters.insert("connection_id".to_string(), Value::Array(connection_ids));

    let existing_rows = list_rows(
        pool,
        "submeter_readings",
        Some(&filters),
        deduped.len().max(1) as i64,
        0,
        "connection_id",
        true,
    )
    .await?;

    let mut existing: HashMap<String, Value> = HashMap::with_capacity(existing_rows.len());
    for row in existing_rows {
        let connection_id = crate::services::amounts::val_str(&row, "connection_id");
        if !connection_id.is_empty() {
            existing.insert(connection_id, row);
        }
    }

    let partition = classify(&existing, &deduped);
    tracing::debug!(
        reading_date = %date_iso,
        new = partition.to_insert.len(),
        changed = partition.to_update.len(),
        unchanged = partition.unchanged,
        "Classified incoming readings"
    );

    let inserted = if partition.to_insert.is_empty() {
        0
    } else {
        let payloads: Vec<Map<String, Value>> = partition
            .to_insert
            .iter()
            .map(|reading| insert_payload(reading, &date_iso, actor))
            .collect();
        insert_rows(pool, "submeter_readings", &payloads).await? as usize
    };

    if partition.existing_count > 0 && !allow_update {
        return Ok(UpsertOutcome::Conflict {
            inserted,
            existing_count: partition.existing_count,
        });
    }

    let mut updated = 0usize;
    let planned = partition.to_update.len();
    for reading in &partition.to_update {
        let mut key = Map::new();
        key.insert(
            "connection_id".to_string(),
            Value::String(reading.connection_id.clone()),
        );
        key.insert("reading_date".to_string(), Value::String(date_iso.clone()));

        let patch = update_payload(reading, actor);
        update_rows_where(pool, "submeter_readings", &key, &patch)
            .await
            .map_err(|error| {
                tracing::error!(
                    connection_id = %reading.connection_id,
                    reading_date = %date_iso,
                    applied = updated,
                    planned,
                    error = %error,
                    "Reading updates stopped partway"
                );
                AppError::Dependency(format!(
                    "Reading updates stopped after {updated} of {planned} rows. \
                     Re-submit the readings to finish."
                ))
            })?;
        updated += 1;
    }

    Ok(UpsertOutcome::Applied { inserted, updated })
}

/// Partition incoming readings against the stored rows for their date: rows
/// with no stored counterpart insert; rows whose tracked fields all match are
/// skipped; the rest update. `per_day_unit` and `snapshot_urls` take part in
/// the diff only when the caller supplied them — absence never means "clear".
pub fn classify(existing: &HashMap<String, Value>, incoming: &[ReadingInput]) -> ReadingPartition {
    let mut partition = ReadingPartition::default();
    for reading in incoming {
        match existing.get(&reading.connection_id) {
            None => partition.to_insert.push(reading.clone()),
            Some(stored) => {
                partition.existing_count += 1;
                if reading_differs(stored, reading) {
                    partition.to_update.push(reading.clone());
                } else {
                    partition.unchanged += 1;
                }
            }
        }
    }
    partition
}

/// Later rows for the same connection replace earlier ones, preserving first
/// appearance order; one call can never write the same (connection, date)
/// key twice.
fn dedup_by_connection(readings: &[ReadingInput]) -> Vec<ReadingInput> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, ReadingInput> = HashMap::new();
    for reading in readings {
        let key = reading.connection_id.trim().to_string();
        if key.is_empty() {
            continue;
        }
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        let mut normalized = reading.clone();
        normalized.connection_id = key.clone();
        latest.insert(key, normalized);
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

fn reading_differs(stored: &Value, incoming: &ReadingInput) -> bool {
    if val_f64(stored, "start_reading") != incoming.start_reading {
        return true;
    }
    if val_f64(stored, "end_reading") != incoming.end_reading {
        return true;
    }
    if let Some(per_day_unit) = incoming.per_day_unit {
        if val_f64(stored, "per_day_unit") != per_day_unit {
            return true;
        }
    }
    if let Some(urls) = &incoming.snapshot_urls {
        // order-sensitive: a reordering counts as a change
        if joined_urls(stored) != urls.join(",") {
            return true;
        }
    }
    false
}

fn joined_urls(stored: &Value) -> String {
    stored
        .as_object()
        .and_then(|obj| obj.get("snapshot_urls"))
        .and_then(Value::as_array)
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

fn insert_payload(reading: &ReadingInput, date_iso: &str, actor: &str) -> Map<String, Value> {
    let mut payload = remove_nulls(serialize_to_map(reading));
    payload.insert(
        "reading_date".to_string(),
        Value::String(date_iso.to_string()),
    );
    payload.insert(
        "created_by_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    payload
}

fn update_payload(reading: &ReadingInput, actor: &str) -> Map<String, Value> {
    let mut patch = remove_nulls(serialize_to_map(reading));
    // the key, not part of the patch
    patch.remove("connection_id");
    patch.insert(
        "updated_by_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    patch
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::{json, Value};

    use super::{classify, dedup_by_connection};
    use crate::schemas::ReadingInput;

    fn reading(connection_id: &str, start: f64, end: f64) -> ReadingInput {
        ReadingInput {
            connection_id: connection_id.to_string(),
            start_reading: start,
            end_reading: end,
            snapshot_urls: None,
            per_day_unit: None,
        }
    }

    fn stored(start: f64, end: f64) -> Value {
        json!({"connection_id": "C1", "start_reading": start, "end_reading": end})
    }

    #[test]
    fn new_rows_go_to_insert() {
        let partition = classify(&HashMap::new(), &[reading("C1", 100.0, 150.0)]);
        assert_eq!(partition.to_insert.len(), 1);
        assert_eq!(partition.existing_count, 0);
        assert!(partition.to_update.is_empty());
    }

    #[test]
    fn identical_rows_are_not_rewritten() {
        let mut existing = HashMap::new();
        existing.insert("C1".to_string(), stored(100.0, 150.0));

        let partition = classify(&existing, &[reading("C1", 100.0, 150.0)]);
        assert!(partition.to_insert.is_empty());
        assert!(partition.to_update.is_empty());
        assert_eq!(partition.unchanged, 1);
        // still counted as existing for the conflict payload
        assert_eq!(partition.existing_count, 1);
    }

    #[test]
    fn changed_readings_update() {
        let mut existing = HashMap::new();
        existing.insert("C1".to_string(), stored(100.0, 150.0));

        let partition = classify(&existing, &[reading("C1", 100.0, 160.0)]);
        assert_eq!(partition.to_update.len(), 1);
        assert_eq!(partition.unchanged, 0);
    }

    #[test]
    fn per_day_unit_compared_only_when_supplied() {
        let mut existing = HashMap::new();
        existing.insert(
            "C1".to_string(),
            json!({"connection_id": "C1", "start_reading": 100.0, "end_reading": 150.0, "per_day_unit": 7.5}),
        );

        // absent per_day_unit is not "set to null"
        let same = classify(&existing, &[reading("C1", 100.0, 150.0)]);
        assert!(same.to_update.is_empty());

        let mut with_override = reading("C1", 100.0, 150.0);
        with_override.per_day_unit = Some(9.0);
        let changed = classify(&existing, &[with_override]);
        assert_eq!(changed.to_update.len(), 1);
    }

    #[test]
    fn snapshot_order_matters() {
        let mut existing = HashMap::new();
        existing.insert(
            "C1".to_string(),
            json!({
                "connection_id": "C1",
                "start_reading": 100.0,
                "end_reading": 150.0,
                "snapshot_urls": ["https://img/a.jpg", "https://img/b.jpg"],
            }),
        );

        let mut same_order = reading("C1", 100.0, 150.0);
        same_order.snapshot_urls = Some(vec![
            "https://img/a.jpg".to_string(),
            "https://img/b.jpg".to_string(),
        ]);
        assert!(classify(&existing, &[same_order]).to_update.is_empty());

        let mut reordered = reading("C1", 100.0, 150.0);
        reordered.snapshot_urls = Some(vec![
            "https://img/b.jpg".to_string(),
            "https://img/a.jpg".to_string(),
        ]);
        assert_eq!(classify(&existing, &[reordered]).to_update.len(), 1);
    }

    #[test]
    fn duplicate_connections_collapse_to_the_last_row() {
        let deduped = dedup_by_connection(&[
            reading("C1", 100.0, 150.0),
            reading("C2", 10.0, 20.0),
            reading("C1", 100.0, 155.0),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].connection_id, "C1");
        assert_eq!(deduped[0].end_reading, 155.0);
        assert_eq!(deduped[1].connection_id, "C2");
    }

    #[test]
    fn blank_connection_ids_are_dropped() {
        let deduped = dedup_by_connection(&[reading("  ", 1.0, 2.0), reading("C1", 1.0, 2.0)]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].connection_id, "C1");
    }
}
