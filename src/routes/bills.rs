use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows, update_row},
    schemas::{clamp_limit_in_range, validate_input, ApproveBillInput, BillPath, BillsQuery},
    services::{
        amounts::{self, val_str},
        audit::write_audit_log,
        status::BillStatus,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/bills", axum::routing::get(list_bills))
        .route("/bills/{bill_id}/approve", axum::routing::post(approve_bill))
}

/// Bill listing enriched with the two computed figures the batching UI keys
/// on: today's payable amount and whether surcharges outgrew the approved
/// amount (re-approval required before batching).
async fn list_bills(
    State(state): State<AppState>,
    Query(query): Query<BillsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let _user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        let status = BillStatus::parse(&status)?;
        filters.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
    }
    if let Some(connection_id) = non_empty_opt(query.connection_id.as_deref()) {
        filters.insert("connection_id".to_string(), Value::String(connection_id));
    }
    if let Some(batch_id) = non_empty_opt(query.batch_id.as_deref()) {
        filters.insert("batch_id".to_string(), Value::String(batch_id));
    }
    if query.unbatched {
        filters.insert("batch_id__is_null".to_string(), Value::Bool(true));
    }

    let mut rows = list_rows(
        pool,
        "bills",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "due_date",
        true,
    )
    .await?;

    let today = amounts::today_in(state.config.billing_timezone);
    for row in &mut rows {
        let payable = amounts::payable_amount(row, today);
        let increased = amounts::is_amount_increased(row, today);
        if let Some(obj) = row.as_object_mut() {
            obj.insert("payable_amount".to_string(), json!(payable));
            obj.insert("amount_increased".to_string(), Value::Bool(increased));
        }
    }

    Ok(Json(json!({ "data": rows })))
}

/// Reviewer acceptance: fixes the approved amount a batch settlement will
/// use. Only pre-batch bills can be (re-)approved; once an item is in a
/// batch its figures are frozen until it is removed.
async fn approve_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    Json(payload): Json<ApproveBillInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let bill = get_row(pool, "bills", &path.bill_id, "id").await?;
    let current = BillStatus::parse(&val_str(&bill, "status"))?;
    if !matches!(current, BillStatus::New | BillStatus::Approved) {
        return Err(AppError::Conflict(format!(
            "Bill in status '{}' cannot be approved.",
            current.as_str()
        )));
    }

    let today = amounts::today_in(state.config.billing_timezone);
    let approved_amount = payload
        .approved_amount
        .unwrap_or_else(|| amounts::payable_amount(&bill, today));

    let mut patch = Map::new();
    patch.insert("approved_amount".to_string(), json!(approved_amount));
    patch.insert(
        "status".to_string(),
        Value::String(BillStatus::Approved.as_str().to_string()),
    );
    patch.insert(
        "updated_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let updated = update_row(pool, "bills", &path.bill_id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "approve",
        "bills",
        Some(&path.bill_id),
        Some(bill),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
