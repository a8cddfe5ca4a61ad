use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn default_limit() -> i64 {
    100
}
fn default_false() -> bool {
    false
}
fn default_pay_type_batch() -> String {
    "batch".to_string()
}

/// One selected item on batch creation. `paytype == 0` routes the id to the
/// recharges table; any other value routes it to bills.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BatchItemRef {
    pub id: String,
    #[serde(default)]
    pub paytype: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateBatchInput {
    #[validate(length(min = 1, message = "at least one item is required"))]
    pub items: Vec<BatchItemRef>,
    // camelCase aliases keep the legacy client payloads working
    #[serde(alias = "batchName")]
    #[validate(length(max = 120))]
    pub batch_name: Option<String>,
    /// Optional valid-until date for the batch, YYYY-MM-DD.
    pub validate_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AddBatchItemsInput {
    #[serde(default, alias = "billIds")]
    pub bill_ids: Vec<String>,
    #[serde(default, alias = "rechargeIds")]
    pub recharge_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RemoveBatchItemInput {
    pub item_id: String,
    /// "bill" or "recharge".
    pub item_type: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct ProcessBatchPaymentInput {
    #[serde(alias = "batchId")]
    pub batch_id: String,
    #[serde(alias = "transactionReference")]
    #[validate(length(min = 1, max = 64))]
    pub transaction_ref: String,
    #[serde(alias = "paymentMode")]
    #[validate(length(min = 1, max = 40))]
    pub payment_mode: String,
    #[validate(length(max = 500))]
    pub remarks: Option<String>,
    #[validate(range(min = 0.0))]
    pub amount: Option<f64>,
    /// YYYY-MM-DD; defaults to today in the billing timezone.
    #[serde(alias = "transactionDate")]
    pub transaction_date: Option<String>,
    /// Target batch status after the transaction is recorded.
    pub batch_status: Option<String>,
    #[serde(default = "default_pay_type_batch")]
    pub transaction_pay_type: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct ReadingInput {
    #[validate(length(min = 1, max = 64))]
    pub connection_id: String,
    #[validate(range(min = 0.0))]
    pub start_reading: f64,
    #[validate(range(min = 0.0))]
    pub end_reading: f64,
    pub snapshot_urls: Option<Vec<String>>,
    /// Explicit per-day consumption, used to correct meter rollover.
    #[validate(range(min = 0.0))]
    pub per_day_unit: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct BulkReadingsInput {
    /// YYYY-MM-DD.
    pub reading_date: String,
    #[validate(length(min = 1, message = "at least one reading is required"), nested)]
    pub readings: Vec<ReadingInput>,
    #[serde(default = "default_false")]
    pub allow_update: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct ApproveBillInput {
    #[validate(range(min = 0.0))]
    pub approved_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchesQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionsQuery {
    pub batch_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadingsQuery {
    pub connection_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillsQuery {
    pub status: Option<String>,
    pub connection_id: Option<String>,
    pub batch_id: Option<String>,
    #[serde(default = "default_false")]
    pub unbatched: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RechargesQuery {
    pub status: Option<String>,
    pub connection_id: Option<String>,
    pub batch_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchPath {
    pub batch_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillPath {
    pub bill_id: String,
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

#[cfg(test)]
mod tests {
    use super::{clamp_limit_in_range, validate_input, BulkReadingsInput, ReadingInput};

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit_in_range(0, 1, 500), 1);
        assert_eq!(clamp_limit_in_range(5000, 1, 500), 500);
        assert_eq!(clamp_limit_in_range(42, 1, 500), 42);
    }

    #[test]
    fn readings_payload_requires_rows() {
        let empty = BulkReadingsInput {
            reading_date: "2024-06-01".to_string(),
            readings: Vec::new(),
            allow_update: false,
        };
        assert!(validate_input(&empty).is_err());

        let negative = BulkReadingsInput {
            reading_date: "2024-06-01".to_string(),
            readings: vec![ReadingInput {
                connection_id: "C1".to_string(),
                start_reading: -1.0,
                end_reading: 10.0,
                snapshot_urls: None,
                per_day_unit: None,
            }],
            allow_update: false,
        };
        assert!(validate_input(&negative).is_err());

        let ok = BulkReadingsInput {
            reading_date: "2024-06-01".to_string(),
            readings: vec![ReadingInput {
                connection_id: "C1".to_string(),
                start_reading: 100.0,
                end_reading: 150.0,
                snapshot_urls: None,
                per_day_unit: None,
            }],
            allow_update: false,
        };
        assert!(validate_input(&ok).is_ok());
    }
}
