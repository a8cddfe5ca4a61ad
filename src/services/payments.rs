use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::repository::table_service::{create_row, get_row, list_rows, update_rows_where};
use crate::schemas::ProcessBatchPaymentInput;
use crate::services::amounts::{self, val_str};
use crate::services::batches::{record_batch_event, set_batch_status};
use crate::services::gateway::notify_payment_recorded;
use crate::services::status::{BatchStatus, BillStatus, RechargeStatus};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PaymentReceipt {
    pub transaction_id: String,
    pub amount: f64,
    pub message: String,
}

/// Record a settlement against a batch and advance statuses.
///
/// Ordering is deliberate and load-bearing:
///   1. validation, including the target status transition, before any write;
///   2. both totals read before any write (never record a transaction
///      against unknown totals);
///   3. the transaction row inserted before any status moves — it is the
///      audit artifact of record, so no effect may precede it;
///   4. member statuses, then the batch row.
/// A failure after step 3 leaves a recorded transaction whose effects did not
/// all land; that inconsistency is reported, not auto-repaired, and the
/// unique `transaction_ref` makes a blind retry safe (it surfaces as a
/// conflict instead of a double charge).
pub async fn process_batch_payment(
    pool: &PgPool,
    http_client: &reqwest::Client,
    config: &AppConfig,
    input: &ProcessBatchPaymentInput,
    actor: &str,
) -> AppResult<PaymentReceipt> {
    let batch_id = input.batch_id.trim();
    if batch_id.is_empty() {
        return Err(AppError::BadRequest("batch_id is required.".to_string()));
    }
    let transaction_ref = input.transaction_ref.trim();
    if transaction_ref.is_empty() {
        return Err(AppError::BadRequest(
            "transaction_ref is required.".to_string(),
        ));
    }
    let payment_mode = input.payment_mode.trim();
    if payment_mode.is_empty() {
        return Err(AppError::BadRequest("payment_mode is required.".to_string()));
    }

    let batch = get_row(pool, "batches", batch_id, "id").await?;
    let target_status = input
        .batch_status
        .as_deref()
        .map(BatchStatus::parse)
        .transpose()?;
    if let Some(target) = target_status {
        // Reject an illegal transition before anything is written.
        BatchStatus::parse(&val_str(&batch, "status"))?.advance(target)?;
    }

    let mut filters = Map::new();
    filters.insert("batch_id".to_string(), Value::String(batch_id.to_string()));
    let bills = list_rows(pool, "bills", Some(&filters), 1000, 0, "created_at", true).await?;
    let recharges = list_rows(pool, "recharges", Some(&filters), 1000, 0, "created_at", true).await?;

    let unpaid_bills: Vec<Value> = bills
        .into_iter()
        .filter(|bill| val_str(bill, "status") != BillStatus::Paid.as_str())
        .collect();
    let unpaid_recharges: Vec<Value> = recharges
        .into_iter()
        .filter(|recharge| val_str(recharge, "status") != RechargeStatus::Paid.as_str())
        .collect();

    let bill_total = amounts::batch_total(&unpaid_bills, &[]);
    let recharge_total = amounts::batch_total(&[], &unpaid_recharges);
    let computed_total = bill_total + recharge_total;

    let today = amounts::today_in(config.billing_timezone);
    let record = transaction_record(input, actor, computed_total, &today.to_string());
    let transaction = create_row(pool, "payment_transactions", &record).await?;
    let transaction_id = val_str(&transaction, "id");
    let amount = amounts::val_f64(&transaction, "amount");

    if target_status == Some(BatchStatus::Processing) {
        if bill_total > 0.0 {
            advance_members(pool, "bills", batch_id, BillStatus::Batch.as_str(), transaction_ref)
                .await?;
        }
        if recharge_total > 0.0 {
            advance_members(
                pool,
                "recharges",
                batch_id,
                RechargeStatus::Batch.as_str(),
                transaction_ref,
            )
            .await?;
        }
    }

    if let Some(target) = target_status {
        set_batch_status(pool, &batch, target, actor)
            .await
            .map_err(|error| {
                tracing::error!(
                    batch_id,
                    transaction_ref,
                    error = %error,
                    "Batch status did not advance after the transaction was recorded"
                );
                AppError::Dependency(format!(
                    "Transaction {transaction_ref} was recorded, but the batch status did not \
                     advance. Re-query the batch before retrying."
                ))
            })?;
    }

    let note = format!("{payment_mode} {transaction_ref}");
    record_batch_event(
        pool,
        batch_id,
        "payment_recorded",
        actor,
        None,
        target_status.map(BatchStatus::as_str),
        Some(note.as_str()),
    )
    .await;

    let event = json!({
        "event": "payment.recorded",
        "batch_id": batch_id,
        "transaction_ref": transaction_ref,
        "amount": amount,
    });
    notify_payment_recorded(http_client, config, &event).await;

    Ok(PaymentReceipt {
        transaction_id,
        amount,
        message: format!("Payment of {amount:.2} recorded against batch {batch_id}."),
    })
}

/// Build the transaction row. Caller-supplied amount and date win; otherwise
/// the computed batch total and today's billing-calendar date fill in.
fn transaction_record(
    input: &ProcessBatchPaymentInput,
    actor: &str,
    computed_total: f64,
    today_iso: &str,
) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert(
        "batch_id".to_string(),
        Value::String(input.batch_id.trim().to_string()),
    );
    record.insert(
        "transaction_ref".to_string(),
        Value::String(input.transaction_ref.trim().to_string()),
    );
    record.insert(
        "payment_method".to_string(),
        Value::String(input.payment_mode.trim().to_string()),
    );
    record.insert(
        "amount".to_string(),
        json!(input.amount.unwrap_or(computed_total)),
    );
    record.insert(
        "transaction_date".to_string(),
        Value::String(
            input
                .transaction_date
                .as_deref()
                .map(str::trim)
                .filter(|date| !date.is_empty())
                .unwrap_or(today_iso)
                .to_string(),
        ),
    );
    record.insert("status".to_string(), Value::String("pending".to_string()));
    record.insert(
        "pay_type".to_string(),
        Value::String(input.transaction_pay_type.trim().to_string()),
    );
    if let Some(remarks) = input
        .remarks
        .as_deref()
        .map(str::trim)
        .filter(|remarks| !remarks.is_empty())
    {
        record.insert("remarks".to_string(), Value::String(remarks.to_string()));
    }
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(actor.to_string()),
    );
    record
}

/// Move every member of the batch still in `from_status` to `payment` in one
/// batch-scoped statement. Failing here after the transaction insert is the
/// detected-but-unresolved inconsistency described in the module docs.
async fn advance_members(
    pool: &PgPool,
    table: &'static str,
    batch_id: &str,
    from_status: &str,
    transaction_ref: &str,
) -> AppResult<u64> {
    let mut filters = Map::new();
    filters.insert("batch_id".to_string(), Value::String(batch_id.to_string()));
    filters.insert(
        "status".to_string(),
        Value::String(from_status.to_string()),
    );
    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("payment".to_string()));

    update_rows_where(pool, table, &filters, &patch)
        .await
        .map_err(|error| {
            tracing::error!(
                batch_id,
                table,
                transaction_ref,
                error = %error,
                "Member statuses did not advance after the transaction was recorded"
            );
            AppError::Dependency(format!(
                "Transaction {transaction_ref} was recorded, but {table} statuses did not \
                 advance. Re-query the batch before retrying."
            ))
        })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::transaction_record;
    use crate::schemas::ProcessBatchPaymentInput;

    fn input() -> ProcessBatchPaymentInput {
        ProcessBatchPaymentInput {
            batch_id: "b-1".to_string(),
            transaction_ref: " NEFT12345678 ".to_string(),
            payment_mode: "NEFT".to_string(),
            remarks: None,
            amount: None,
            transaction_date: None,
            batch_status: Some("processing".to_string()),
            transaction_pay_type: "batch".to_string(),
        }
    }

    #[test]
    fn defaults_amount_and_date_from_computed_values() {
        let record = transaction_record(&input(), "user-1", 500.0, "2024-06-15");
        assert_eq!(record.get("amount"), Some(&Value::from(500.0)));
        assert_eq!(
            record.get("transaction_date").and_then(Value::as_str),
            Some("2024-06-15")
        );
        assert_eq!(record.get("status").and_then(Value::as_str), Some("pending"));
        assert_eq!(
            record.get("transaction_ref").and_then(Value::as_str),
            Some("NEFT12345678")
        );
        assert_eq!(record.get("pay_type").and_then(Value::as_str), Some("batch"));
        assert!(!record.contains_key("remarks"));
    }

    #[test]
    fn supplied_amount_and_date_win() {
        let mut custom = input();
        custom.amount = Some(450.0);
        custom.transaction_date = Some("2024-06-01".to_string());
        custom.remarks = Some("partial settlement".to_string());

        let record = transaction_record(&custom, "user-1", 500.0, "2024-06-15");
        assert_eq!(record.get("amount"), Some(&Value::from(450.0)));
        assert_eq!(
            record.get("transaction_date").and_then(Value::as_str),
            Some("2024-06-01")
        );
        assert_eq!(
            record.get("remarks").and_then(Value::as_str),
            Some("partial settlement")
        );
    }
}
