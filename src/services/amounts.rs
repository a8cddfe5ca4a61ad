use chrono::NaiveDate;
use chrono_tz::Tz;
use serde_json::Value;

/// Current date on the utility's billing calendar. Due/discount windows and
/// defaulted transaction dates all use this, never the server's UTC date.
pub fn today_in(timezone: Tz) -> NaiveDate {
    chrono::Utc::now().with_timezone(&timezone).date_naive()
}

/// Amount a consumer owes on a bill today: the discounted figure through the
/// discount date (inclusive), the after-due figure past it. A bill without a
/// discount window, or without an after-due figure, falls back to its base
/// amount.
pub fn payable_amount(bill: &Value, today: NaiveDate) -> f64 {
    let within_discount = val_date(bill, "discount_date").is_some_and(|date| today <= date);
    if within_discount {
        return val_f64(bill, "bill_amount");
    }
    let after_due = val_f64(bill, "after_due_amount");
    if after_due > 0.0 {
        after_due
    } else {
        val_f64(bill, "bill_amount")
    }
}

/// True when surcharges have pushed the payable amount past what a reviewer
/// approved: the bill is due (or overdue), still unpaid, and its after-due
/// figure now exceeds the approved one. Such bills need re-approval before
/// they can be batched.
pub fn is_amount_increased(bill: &Value, today: NaiveDate) -> bool {
    if val_str(bill, "status") == "paid" {
        return false;
    }
    let due = match val_date(bill, "due_date") {
        Some(date) => date,
        None => return false,
    };
    if due > today {
        return false;
    }
    val_f64(bill, "after_due_amount") > val_f64(bill, "approved_amount")
}

/// Aggregate payable for a batch: approved bill amounts plus recharge
/// amounts. Unset or null amounts count as zero; empty input sums to zero.
pub fn batch_total(bills: &[Value], recharges: &[Value]) -> f64 {
    let bill_sum: f64 = bills
        .iter()
        .map(|bill| val_f64(bill, "approved_amount"))
        .sum();
    let recharge_sum: f64 = recharges
        .iter()
        .map(|recharge| val_f64(recharge, "recharge_amount"))
        .sum();
    bill_sum + recharge_sum
}

/// Numeric field that may arrive as a JSON number or a numeric string
/// (row_to_json renders numerics either way depending on the column type).
pub fn val_f64(row: &Value, key: &str) -> f64 {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(|value| {
            value
                .as_f64()
                .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
        })
        .unwrap_or(0.0)
}

pub fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

/// Date field rendered by the store as YYYY-MM-DD, possibly with a time
/// suffix on timestamp columns.
pub fn val_date(row: &Value, key: &str) -> Option<NaiveDate> {
    let raw = val_str(row, key);
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            raw.get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{batch_total, is_amount_increased, payable_amount, val_date, val_f64};

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn discount_window_is_inclusive() {
        let bill = json!({
            "bill_amount": 480.0,
            "after_due_amount": 520.0,
            "discount_date": "2024-06-10",
        });
        assert_eq!(payable_amount(&bill, date("2024-06-09")), 480.0);
        // today == discount date favors the discount amount
        assert_eq!(payable_amount(&bill, date("2024-06-10")), 480.0);
        assert_eq!(payable_amount(&bill, date("2024-06-11")), 520.0);
    }

    #[test]
    fn missing_figures_fall_back() {
        let no_window = json!({"bill_amount": 300.0, "after_due_amount": 330.0});
        assert_eq!(payable_amount(&no_window, date("2024-06-01")), 330.0);

        let no_after_due = json!({"bill_amount": 300.0, "discount_date": "2024-05-01"});
        assert_eq!(payable_amount(&no_after_due, date("2024-06-01")), 300.0);
    }

    #[test]
    fn amount_increase_needs_due_and_unpaid() {
        let overdue = json!({
            "status": "approved",
            "approved_amount": 500.0,
            "after_due_amount": 545.0,
            "due_date": "2024-06-01",
        });
        assert!(is_amount_increased(&overdue, date("2024-06-05")));
        // due today counts as due
        assert!(is_amount_increased(&overdue, date("2024-06-01")));
        // not yet due
        assert!(!is_amount_increased(&overdue, date("2024-05-20")));

        let paid = json!({
            "status": "paid",
            "approved_amount": 500.0,
            "after_due_amount": 545.0,
            "due_date": "2024-06-01",
        });
        assert!(!is_amount_increased(&paid, date("2024-06-05")));

        let unchanged = json!({
            "status": "approved",
            "approved_amount": 545.0,
            "after_due_amount": 545.0,
            "due_date": "2024-06-01",
        });
        assert!(!is_amount_increased(&unchanged, date("2024-06-05")));
    }

    #[test]
    fn batch_total_is_additive() {
        let bills_a = vec![json!({"approved_amount": 100.0}), json!({"approved_amount": 250.5})];
        let bills_b = vec![json!({"approved_amount": 49.5})];
        let recharges = vec![json!({"recharge_amount": 200.0}), json!({"recharge_amount": null})];

        let combined: Vec<_> = bills_a.iter().chain(bills_b.iter()).cloned().collect();
        assert_eq!(
            batch_total(&combined, &recharges),
            batch_total(&bills_a, &recharges) + batch_total(&bills_b, &[])
        );
        assert_eq!(batch_total(&[], &[]), 0.0);
    }

    #[test]
    fn null_and_string_amounts_coalesce() {
        assert_eq!(val_f64(&json!({"approved_amount": null}), "approved_amount"), 0.0);
        assert_eq!(val_f64(&json!({}), "approved_amount"), 0.0);
        assert_eq!(
            val_f64(&json!({"approved_amount": "123.45"}), "approved_amount"),
            123.45
        );
    }

    #[test]
    fn dates_parse_with_timestamp_suffixes() {
        assert_eq!(
            val_date(&json!({"due_date": "2024-06-01"}), "due_date"),
            Some(date("2024-06-01"))
        );
        assert_eq!(
            val_date(&json!({"due_date": "2024-06-01T00:00:00+05:30"}), "due_date"),
            Some(date("2024-06-01"))
        );
        assert_eq!(val_date(&json!({"due_date": ""}), "due_date"), None);
    }
}
