use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::repository::table_service::{create_row, get_row, update_row};
use crate::services::amounts::val_str;
use crate::services::bulk::update_ids_in_chunks;
use crate::services::status::{BatchStatus, BillStatus, ItemType, RechargeStatus};

#[derive(Debug, Clone, serde::Serialize)]
pub struct CreateBatchOutcome {
    pub batch_id: String,
    pub bills_added: usize,
    pub recharges_added: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AddItemsOutcome {
    pub bills_added: usize,
    pub recharges_added: usize,
}

/// Create a batch and pull its initial members in.
///
/// The batch row is inserted first; if that fails nothing else happens. The
/// membership writes are chunked and not transactional with the insert — a
/// chunk failure leaves the batch row in place with partial membership, and
/// the error tells the caller to finish the assignment via `add_items`
/// (idempotent: re-setting `batch_id` + status on an already-joined item is
/// a no-op change).
pub async fn create_batch(
    pool: &PgPool,
    config: &AppConfig,
    batch_name: Option<&str>,
    valid_until: Option<&str>,
    bill_ids: &[String],
    recharge_ids: &[String],
    actor: &str,
) -> AppResult<CreateBatchOutcome> {
    let mut record = Map::new();
    record.insert(
        "status".to_string(),
        Value::String(BatchStatus::Unpaid.as_str().to_string()),
    );
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    if let Some(name) = batch_name.map(str::trim).filter(|name| !name.is_empty()) {
        record.insert("batch_name".to_string(), Value::String(name.to_string()));
    }
    if let Some(until) = valid_until.map(str::trim).filter(|until| !until.is_empty()) {
        record.insert("valid_until".to_string(), Value::String(until.to_string()));
    }

    let created = create_row(pool, "batches", &record).await?;
    let batch_id = val_str(&created, "id");
    if batch_id.is_empty() {
        return Err(AppError::Internal(
            "Batch was created without an id.".to_string(),
        ));
    }

    record_batch_event(
        pool,
        &batch_id,
        "created",
        actor,
        None,
        Some(BatchStatus::Unpaid.as_str()),
        None,
    )
    .await;

    let bills_added = assign_members(pool, config, &batch_id, ItemType::Bill, bill_ids).await?;
    let recharges_added =
        assign_members(pool, config, &batch_id, ItemType::Recharge, recharge_ids).await?;

    Ok(CreateBatchOutcome {
        batch_id,
        bills_added,
        recharges_added,
    })
}

/// Add bills and/or recharges to an existing batch. Doubles as the recovery
/// path after an interrupted `create_batch`: membership writes are the same
/// idempotent `batch_id` + status patch.
///
/// The batch's audit stamp is written first and a failure there aborts before
/// any item is touched. Bills are assigned before recharges; a chunk failure
/// in either surfaces which collection stopped and how many joined, without
/// rolling back the other.
pub async fn add_items(
    pool: &PgPool,
    config: &AppConfig,
    batch_id: &str,
    bill_ids: &[String],
    recharge_ids: &[String],
    actor: &str,
) -> AppResult<AddItemsOutcome> {
    if bill_ids.is_empty() && recharge_ids.is_empty() {
        return Err(AppError::BadRequest(
            "Provide at least one bill or recharge to add.".to_string(),
        ));
    }

    // Existence check doubles as the read the audit stamp depends on.
    let _batch = get_row(pool, "batches", batch_id, "id").await?;

    let mut stamp = Map::new();
    stamp.insert(
        "updated_by_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    stamp.insert(
        "updated_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    update_row(pool, "batches", batch_id, &stamp, "id").await?;

    let bills_added = assign_members(pool, config, batch_id, ItemType::Bill, bill_ids).await?;
    let recharges_added =
        assign_members(pool, config, batch_id, ItemType::Recharge, recharge_ids).await?;

    let note = format!("{bills_added} bills, {recharges_added} recharges");
    record_batch_event(
        pool,
        batch_id,
        "items_added",
        actor,
        None,
        None,
        Some(note.as_str()),
    )
    .await;

    Ok(AddItemsOutcome {
        bills_added,
        recharges_added,
    })
}

/// Pull one item out of its batch: a single-row update clearing `batch_id`
/// and resetting status in the same statement, so the two fields can never
/// diverge.
pub async fn remove_item(
    pool: &PgPool,
    item_type: ItemType,
    item_id: &str,
    actor: &str,
) -> AppResult<Value> {
    let mut patch = Map::new();
    patch.insert("batch_id".to_string(), Value::Null);
    patch.insert(
        "status".to_string(),
        Value::String(item_type.pre_batch_status().to_string()),
    );
    patch.insert(
        "updated_by_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    update_row(pool, item_type.table(), item_id, &patch, "id").await
}

/// Advance a batch's status through the central transition table and stamp
/// the actor. Backward moves are rejected with a conflict; re-applying the
/// current status is accepted.
pub async fn set_batch_status(
    pool: &PgPool,
    batch: &Value,
    to: BatchStatus,
    actor: &str,
) -> AppResult<Value> {
    let batch_id = val_str(batch, "id");
    let from = BatchStatus::parse(&val_str(batch, "status"))?;
    let next = from.advance(to)?;

    let mut patch = Map::new();
    patch.insert(
        "status".to_string(),
        Value::String(next.as_str().to_string()),
    );
    patch.insert(
        "updated_by_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    let updated = update_row(pool, "batches", &batch_id, &patch, "id").await?;

    record_batch_event(
        pool,
        &batch_id,
        "status_transition",
        actor,
        Some(from.as_str()),
        Some(next.as_str()),
        None,
    )
    .await;

    Ok(updated)
}

/// Append one entry to the batch's lifecycle log. The log is advisory:
/// a write failure is logged and swallowed so it can never fail the
/// operation it describes.
pub async fn record_batch_event(
    pool: &PgPool,
    batch_id: &str,
    action: &str,
    actor: &str,
    from_status: Option<&str>,
    to_status: Option<&str>,
    note: Option<&str>,
) {
    let mut event = Map::new();
    event.insert("batch_id".to_string(), Value::String(batch_id.to_string()));
    event.insert("action".to_string(), Value::String(action.to_string()));
    event.insert(
        "actor_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    if let Some(from) = from_status {
        event.insert("from_status".to_string(), Value::String(from.to_string()));
    }
    if let Some(to) = to_status {
        event.insert("to_status".to_string(), Value::String(to.to_string()));
    }
    if let Some(note) = note {
        event.insert("note".to_string(), Value::String(note.to_string()));
    }

    if let Err(error) = create_row(pool, "batch_events", &event).await {
        tracing::warn!(batch_id, action, error = %error, "Failed to record batch lifecycle event");
    }
}

/// Chunk-assign a set of items to a batch. Sets `batch_id` and the in-batch
/// status together in every statement (the two must never move
/// independently).
async fn assign_members(
    pool: &PgPool,
    config: &AppConfig,
    batch_id: &str,
    item_type: ItemType,
    ids: &[String],
) -> AppResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let in_batch = match item_type {
        ItemType::Bill => BillStatus::Batch.as_str(),
        ItemType::Recharge => RechargeStatus::Batch.as_str(),
    };
    let mut patch = Map::new();
    patch.insert("batch_id".to_string(), Value::String(batch_id.to_string()));
    patch.insert("status".to_string(), Value::String(in_batch.to_string()));

    update_ids_in_chunks(pool, item_type.table(), ids, &patch, config.bulk_chunk_size)
        .await
        .map_err(|failure| {
            let applied = failure.succeeded_ids.len();
            let total = ids.len();
            let collection = item_type.table();
            tracing::error!(
                batch_id,
                collection,
                applied,
                total,
                failed_chunk = failure.failed_chunk,
                cause = %failure.cause,
                "Batch membership assignment stopped partway"
            );
            AppError::Dependency(format!(
                "Batch {batch_id}: only {applied} of {total} {collection} joined before the store failed. \
                 Re-run the item assignment for this batch to finish."
            ))
        })
}
