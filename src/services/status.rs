use crate::error::AppError;

/// Settlement lifecycle of a batch. Transitions only move forward;
/// re-applying the current status is accepted so retries stay idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Unpaid,
    Processing,
    Payment,
    Paid,
}

impl BatchStatus {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unpaid" => Ok(Self::Unpaid),
            "processing" => Ok(Self::Processing),
            "payment" => Ok(Self::Payment),
            "paid" => Ok(Self::Paid),
            _ => Err(AppError::BadRequest(format!(
                "Unknown batch status '{raw}'."
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Processing => "processing",
            Self::Payment => "payment",
            Self::Paid => "paid",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Unpaid => 0,
            Self::Processing => 1,
            Self::Payment => 2,
            Self::Paid => 3,
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() >= self.rank()
    }

    pub fn advance(self, next: Self) -> Result<Self, AppError> {
        if self.can_advance_to(next) {
            return Ok(next);
        }
        Err(AppError::Conflict(format!(
            "Batch status cannot move backward from '{}' to '{}'.",
            self.as_str(),
            next.as_str()
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillStatus {
    New,
    Approved,
    Batch,
    Payment,
    Paid,
    Rejected,
}

impl BillStatus {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "approved" => Ok(Self::Approved),
            "batch" => Ok(Self::Batch),
            "payment" => Ok(Self::Payment),
            "paid" => Ok(Self::Paid),
            "rejected" => Ok(Self::Rejected),
            _ => Err(AppError::BadRequest(format!("Unknown bill status '{raw}'."))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Approved => "approved",
            Self::Batch => "batch",
            Self::Payment => "payment",
            Self::Paid => "paid",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RechargeStatus {
    New,
    Batch,
    Payment,
    Paid,
}

impl RechargeStatus {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" | "approved" => Ok(Self::New),
            "batch" => Ok(Self::Batch),
            "payment" => Ok(Self::Payment),
            "paid" => Ok(Self::Paid),
            _ => Err(AppError::BadRequest(format!(
                "Unknown recharge status '{raw}'."
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Batch => "batch",
            Self::Payment => "payment",
            Self::Paid => "paid",
        }
    }
}

/// Which collection a payable item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Bill,
    Recharge,
}

impl ItemType {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bill" | "bills" => Ok(Self::Bill),
            "recharge" | "recharges" => Ok(Self::Recharge),
            _ => Err(AppError::BadRequest(format!("Unknown item type '{raw}'."))),
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Bill => "bills",
            Self::Recharge => "recharges",
        }
    }

    /// Status an item returns to when pulled out of a batch.
    pub fn pre_batch_status(self) -> &'static str {
        match self {
            Self::Bill => BillStatus::Approved.as_str(),
            Self::Recharge => RechargeStatus::New.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchStatus, BillStatus, ItemType, RechargeStatus};

    #[test]
    fn batch_transitions_are_monotonic() {
        assert!(BatchStatus::Unpaid.advance(BatchStatus::Processing).is_ok());
        assert!(BatchStatus::Processing.advance(BatchStatus::Payment).is_ok());
        assert!(BatchStatus::Payment.advance(BatchStatus::Paid).is_ok());
        // forward jumps are allowed
        assert!(BatchStatus::Unpaid.advance(BatchStatus::Paid).is_ok());
        // backward is rejected
        assert!(BatchStatus::Paid.advance(BatchStatus::Payment).is_err());
        assert!(BatchStatus::Payment.advance(BatchStatus::Unpaid).is_err());
    }

    #[test]
    fn reapplying_the_same_status_is_idempotent() {
        assert_eq!(
            BatchStatus::Processing.advance(BatchStatus::Processing).unwrap(),
            BatchStatus::Processing
        );
        assert_eq!(
            BatchStatus::Paid.advance(BatchStatus::Paid).unwrap(),
            BatchStatus::Paid
        );
    }

    #[test]
    fn parsing_round_trips_and_rejects_typos() {
        for status in [
            BatchStatus::Unpaid,
            BatchStatus::Processing,
            BatchStatus::Payment,
            BatchStatus::Paid,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(BatchStatus::parse("procesing").is_err());
        assert!(BillStatus::parse("aproved").is_err());
        assert_eq!(BillStatus::parse(" Approved ").unwrap(), BillStatus::Approved);
        // legacy vocabulary folds into the recharge initial state
        assert_eq!(
            RechargeStatus::parse("approved").unwrap(),
            RechargeStatus::New
        );
    }

    #[test]
    fn item_types_route_to_tables() {
        assert_eq!(ItemType::parse("bill").unwrap().table(), "bills");
        assert_eq!(ItemType::parse("recharge").unwrap().table(), "recharges");
        assert_eq!(ItemType::Bill.pre_batch_status(), "approved");
        assert_eq!(ItemType::Recharge.pre_batch_status(), "new");
        assert!(ItemType::parse("meter").is_err());
    }
}
