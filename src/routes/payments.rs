use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows, update_row, update_rows_where},
    schemas::{clamp_limit_in_range, validate_input, ProcessBatchPaymentInput, TransactionsQuery},
    services::{
        audit::write_audit_log,
        batches::{record_batch_event, set_batch_status},
        gateway::verify_signature,
        payments::process_batch_payment,
        status::{BatchStatus, BillStatus, RechargeStatus},
    },
    state::AppState,
};

/// Actor recorded on mutations driven by the gateway callback rather than a
/// signed-in user.
const GATEWAY_ACTOR: &str = "gateway";

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/payments/batch", axum::routing::post(process_payment))
        .route(
            "/payments/transactions",
            axum::routing::get(list_transactions),
        )
        .route(
            "/payments/gateway/webhook",
            axum::routing::post(gateway_webhook),
        )
}

async fn process_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ProcessBatchPaymentInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let receipt =
        process_batch_payment(pool, &state.http_client, &state.config, &payload, &user_id).await?;

    state
        .batch_totals_cache
        .invalidate(payload.batch_id.trim())
        .await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&user_id),
        "payment_recorded",
        "payment_transactions",
        Some(&receipt.transaction_id),
        None,
        Some(json!({
            "batch_id": payload.batch_id,
            "transaction_ref": payload.transaction_ref,
            "amount": receipt.amount,
        })),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "message": receipt.message,
    })))
}

async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let _user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(batch_id) = non_empty_opt(query.batch_id.as_deref()) {
        filters.insert("batch_id".to_string(), Value::String(batch_id));
    }

    let rows = list_rows(
        pool,
        "payment_transactions",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

/// The external-collaborator hook that drives `payment -> paid`.
///
/// The gateway signs its callback body; an unsigned or stale request is
/// rejected before anything is read. On a settled notification the
/// transaction, the batch members still in `payment`, and the batch row all
/// advance to `paid`.
async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let secret = state
        .config
        .gateway_webhook_secret
        .as_deref()
        .ok_or_else(|| {
            AppError::Dependency("GATEWAY_WEBHOOK_SECRET is not configured.".to_string())
        })?;

    let signature = headers
        .get("x-gateway-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing webhook signature.".to_string()))?;
    if !verify_signature(&body, signature, secret) {
        return Err(AppError::Unauthorized(
            "Invalid webhook signature.".to_string(),
        ));
    }

    let payload: Value = serde_json::from_str(&body)
        .map_err(|_| AppError::BadRequest("Invalid JSON payload.".to_string()))?;
    let transaction_ref = payload
        .get("transaction_ref")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::BadRequest("transaction_ref is required.".to_string()))?;
    let gateway_status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut filters = Map::new();
    filters.insert(
        "transaction_ref".to_string(),
        Value::String(transaction_ref.to_string()),
    );
    let transaction = list_rows(
        pool,
        "payment_transactions",
        Some(&filters),
        1,
        0,
        "created_at",
        false,
    )
    .await?
    .into_iter()
    .next()
    .ok_or_else(|| AppError::NotFound("payment_transactions record not found.".to_string()))?;

    let transaction_id = value_str(&transaction, "id");
    let batch_id = value_str(&transaction, "batch_id");

    match gateway_status {
        "settled" => {
            let mut tx_patch = Map::new();
            tx_patch.insert("status".to_string(), Value::String("paid".to_string()));
            update_row(pool, "payment_transactions", &transaction_id, &tx_patch, "id").await?;

            settle_members(pool, "bills", &batch_id, BillStatus::Payment.as_str()).await?;
            settle_members(pool, "recharges", &batch_id, RechargeStatus::Payment.as_str())
                .await?;

            let batch = get_row(pool, "batches", &batch_id, "id").await?;
            set_batch_status(pool, &batch, BatchStatus::Paid, GATEWAY_ACTOR).await?;

            state.batch_totals_cache.invalidate(&batch_id).await;

            Ok(Json(json!({
                "received": true,
                "transaction_ref": transaction_ref,
                "status": "paid",
            })))
        }
        "failed" => {
            let mut tx_patch = Map::new();
            tx_patch.insert("status".to_string(), Value::String("failed".to_string()));
            update_row(pool, "payment_transactions", &transaction_id, &tx_patch, "id").await?;

            record_batch_event(
                pool,
                &batch_id,
                "payment_failed",
                GATEWAY_ACTOR,
                None,
                None,
                Some(transaction_ref),
            )
            .await;

            Ok(Json(json!({
                "received": true,
                "transaction_ref": transaction_ref,
                "status": "failed",
            })))
        }
        other => {
            tracing::debug!(status = other, "Unhandled gateway notification status");
            Ok(Json(json!({ "received": true })))
        }
    }
}

async fn settle_members(
    pool: &sqlx::PgPool,
    table: &'static str,
    batch_id: &str,
    from_status: &str,
) -> AppResult<u64> {
    let mut filters = Map::new();
    filters.insert("batch_id".to_string(), Value::String(batch_id.to_string()));
    filters.insert(
        "status".to_string(),
        Value::String(from_status.to_string()),
    );
    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("paid".to_string()));
    update_rows_where(pool, table, &filters, &patch).await
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
