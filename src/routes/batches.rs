use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows},
    schemas::{
        clamp_limit_in_range, validate_input, AddBatchItemsInput, BatchPath, BatchesQuery,
        CreateBatchInput, RemoveBatchItemInput,
    },
    services::{
        amounts,
        audit::write_audit_log,
        batches::{add_items, create_batch, remove_item},
        status::{BatchStatus, ItemType},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/batches",
            axum::routing::get(list_batches).post(create_batch_handler),
        )
        .route("/batches/{batch_id}", axum::routing::get(get_batch))
        .route(
            "/batches/{batch_id}/items",
            axum::routing::post(add_batch_items),
        )
        .route(
            "/batches/{batch_id}/remove-item",
            axum::routing::post(remove_batch_item),
        )
}

async fn create_batch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBatchInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    if let Some(valid_until) = non_empty_opt(payload.validate_at.as_deref()) {
        NaiveDate::parse_from_str(&valid_until, "%Y-%m-%d").map_err(|_| {
            AppError::BadRequest("validate_at must be a YYYY-MM-DD date.".to_string())
        })?;
    }

    // paytype 0 routes an item to recharges, anything else to bills
    let mut bill_ids = Vec::new();
    let mut recharge_ids = Vec::new();
    for item in &payload.items {
        let id = item.id.trim().to_string();
        if id.is_empty() {
            continue;
        }
        if item.paytype == 0 {
            recharge_ids.push(id);
        } else {
            bill_ids.push(id);
        }
    }
    if bill_ids.is_empty() && recharge_ids.is_empty() {
        return Err(AppError::BadRequest(
            "No usable item ids were supplied.".to_string(),
        ));
    }

    let outcome = create_batch(
        pool,
        &state.config,
        payload.batch_name.as_deref(),
        payload.validate_at.as_deref(),
        &bill_ids,
        &recharge_ids,
        &user_id,
    )
    .await?;

    state
        .batch_totals_cache
        .invalidate(&outcome.batch_id)
        .await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "create",
        "batches",
        Some(&outcome.batch_id),
        None,
        Some(json!({
            "bills_added": outcome.bills_added,
            "recharges_added": outcome.recharges_added,
        })),
    )
    .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({
            "message": "Batch created.",
            "batch_id": outcome.batch_id,
        })),
    ))
}

async fn add_batch_items(
    State(state): State<AppState>,
    Path(path): Path<BatchPath>,
    headers: HeaderMap,
    Json(payload): Json<AddBatchItemsInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let bill_ids = trimmed_ids(&payload.bill_ids);
    let recharge_ids = trimmed_ids(&payload.recharge_ids);

    let outcome = add_items(
        pool,
        &state.config,
        &path.batch_id,
        &bill_ids,
        &recharge_ids,
        &user_id,
    )
    .await?;

    state.batch_totals_cache.invalidate(&path.batch_id).await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "items_added",
        "batches",
        Some(&path.batch_id),
        None,
        Some(json!({
            "bills_added": outcome.bills_added,
            "recharges_added": outcome.recharges_added,
        })),
    )
    .await;

    Ok(Json(json!({
        "message": "Items added to batch.",
        "batch_id": path.batch_id,
        "bills_added": outcome.bills_added,
        "recharges_added": outcome.recharges_added,
    })))
}

async fn remove_batch_item(
    State(state): State<AppState>,
    Path(path): Path<BatchPath>,
    headers: HeaderMap,
    Json(payload): Json<RemoveBatchItemInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let item_type = ItemType::parse(&payload.item_type)?;
    let item_id = payload.item_id.trim();
    if item_id.is_empty() {
        return Err(AppError::BadRequest("item_id is required.".to_string()));
    }

    let item = get_row(pool, item_type.table(), item_id, "id").await?;
    if value_str(&item, "batch_id") != path.batch_id {
        return Err(AppError::BadRequest(
            "Item does not belong to this batch.".to_string(),
        ));
    }

    let updated = remove_item(pool, item_type, item_id, &user_id).await?;

    state.batch_totals_cache.invalidate(&path.batch_id).await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "item_removed",
        item_type.table(),
        Some(item_id),
        Some(item),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(json!({
        "message": "Item removed from batch.",
        "batch_id": path.batch_id,
        "item_id": item_id,
    })))
}

async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<BatchesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let _user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        // reject typos before they become a silent empty result
        let status = BatchStatus::parse(&status)?;
        filters.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
    }

    let mut rows = list_rows(
        pool,
        "batches",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    let batch_ids: Vec<String> = rows
        .iter()
        .map(|row| value_str(row, "id"))
        .filter(|id| !id.is_empty())
        .collect();
    let totals = load_batch_totals(&state, &batch_ids).await?;

    for row in &mut rows {
        let batch_id = value_str(row, "id");
        if let (Some(obj), Some(total)) = (row.as_object_mut(), totals.get(&batch_id)) {
            obj.insert("totals".to_string(), total.clone());
        }
    }

    Ok(Json(json!({ "data": rows })))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(path): Path<BatchPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let _user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut batch = get_row(pool, "batches", &path.batch_id, "id").await?;

    let mut member_filter = Map::new();
    member_filter.insert(
        "batch_id".to_string(),
        Value::String(path.batch_id.clone()),
    );
    let bills = list_rows(pool, "bills", Some(&member_filter), 1000, 0, "created_at", true).await?;
    let recharges = list_rows(
        pool,
        "recharges",
        Some(&member_filter),
        1000,
        0,
        "created_at",
        true,
    )
    .await?;
    let events = list_rows(
        pool,
        "batch_events",
        Some(&member_filter),
        500,
        0,
        "created_at",
        true,
    )
    .await?;

    let totals = totals_value(&bills, &recharges);
    state
        .batch_totals_cache
        .insert(path.batch_id.clone(), totals.clone())
        .await;

    if let Some(obj) = batch.as_object_mut() {
        obj.insert("totals".to_string(), totals);
        obj.insert("bills".to_string(), Value::Array(bills));
        obj.insert("recharges".to_string(), Value::Array(recharges));
        obj.insert("events".to_string(), Value::Array(events));
    }

    Ok(Json(batch))
}

/// Per-batch member totals, served from the short-TTL cache; misses are
/// loaded with one read per collection across all missing batches.
async fn load_batch_totals(
    state: &AppState,
    batch_ids: &[String],
) -> AppResult<HashMap<String, Value>> {
    let pool = db_pool(state)?;
    let mut totals = HashMap::with_capacity(batch_ids.len());
    let mut missing: Vec<String> = Vec::new();

    for batch_id in batch_ids {
        if let Some(cached) = state.batch_totals_cache.get(batch_id).await {
            totals.insert(batch_id.clone(), cached);
        } else {
            missing.push(batch_id.clone());
        }
    }
    if missing.is_empty() {
        return Ok(totals);
    }

    let mut filters = Map::new();
    filters.insert(
        "batch_id".to_string(),
        Value::Array(missing.iter().cloned().map(Value::String).collect()),
    );
    let bills = list_rows(pool, "bills", Some(&filters), 1000, 0, "created_at", true).await?;
    let recharges = list_rows(pool, "recharges", Some(&filters), 1000, 0, "created_at", true).await?;

    for batch_id in &missing {
        let batch_bills: Vec<Value> = bills
            .iter()
            .filter(|row| value_str(row, "batch_id") == *batch_id)
            .cloned()
            .collect();
        let batch_recharges: Vec<Value> = recharges
            .iter()
            .filter(|row| value_str(row, "batch_id") == *batch_id)
            .cloned()
            .collect();
        let value = totals_value(&batch_bills, &batch_recharges);
        state
            .batch_totals_cache
            .insert(batch_id.clone(), value.clone())
            .await;
        totals.insert(batch_id.clone(), value);
    }

    Ok(totals)
}

fn totals_value(bills: &[Value], recharges: &[Value]) -> Value {
    let bill_total = amounts::batch_total(bills, &[]);
    let recharge_total = amounts::batch_total(&[], recharges);
    json!({
        "bill_count": bills.len(),
        "recharge_count": recharges.len(),
        "bill_total": bill_total,
        "recharge_total": recharge_total,
        "total_amount": bill_total + recharge_total,
    })
}

fn trimmed_ids(ids: &[String]) -> Vec<String> {
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
