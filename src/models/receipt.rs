use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Processing state of a receipt. Stored as TEXT; always decoded through
/// [`ReceiptStatus::parse`] so a bad value in the database fails loudly
/// instead of leaking a free-form string through the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Uploaded,
    OcrInProgress,
    /// Reserved for finer-grained progress; no transition sets it yet.
    OcrCompleted,
    Ready,
    Failed,
    /// Reserved for finer-grained failure; no transition sets it yet.
    ParseFailed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Uploaded => "uploaded",
            ReceiptStatus::OcrInProgress => "ocr_in_progress",
            ReceiptStatus::OcrCompleted => "ocr_completed",
            ReceiptStatus::Ready => "ready",
            ReceiptStatus::Failed => "failed",
            ReceiptStatus::ParseFailed => "parse_failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "uploaded" => Ok(ReceiptStatus::Uploaded),
            "ocr_in_progress" => Ok(ReceiptStatus::OcrInProgress),
            "ocr_completed" => Ok(ReceiptStatus::OcrCompleted),
            "ready" => Ok(ReceiptStatus::Ready),
            "failed" => Ok(ReceiptStatus::Failed),
            "parse_failed" => Ok(ReceiptStatus::ParseFailed),
            other => Err(format!("unknown receipt status: {}", other)),
        }
    }

    /// Terminal statuses end automatic processing; only a user-triggered
    /// reprocess moves a receipt out of one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiptStatus::Ready | ReceiptStatus::Failed | ReceiptStatus::ParseFailed
        )
    }
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receipt row (receipts). `status` stays TEXT here and is validated at
/// the service boundary.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Receipt {
    pub id: Uuid,
    pub user_id: Uuid,
    pub merchant_name: Option<String>,
    pub transaction_date: Option<NaiveDate>,
    pub subtotal: Option<BigDecimal>,
    pub tax_amount: Option<BigDecimal>,
    pub tip_amount: Option<BigDecimal>,
    pub total_amount: Option<BigDecimal>,
    pub image_path: String,
    pub status: String,
    pub ocr_confidence: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Receipt {
    pub fn status(&self) -> Result<ReceiptStatus, String> {
        ReceiptStatus::parse(&self.status)
    }
}

/// Line item row (receipt_items). `line_number` preserves the position on
/// the physical receipt.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReceiptLineItem {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub quantity: i32,
    pub line_number: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ReceiptStatus::Uploaded,
            ReceiptStatus::OcrInProgress,
            ReceiptStatus::OcrCompleted,
            ReceiptStatus::Ready,
            ReceiptStatus::Failed,
            ReceiptStatus::ParseFailed,
        ] {
            assert_eq!(ReceiptStatus::parse(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(ReceiptStatus::parse("processing").is_err());
        assert!(ReceiptStatus::parse("").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ReceiptStatus::Ready.is_terminal());
        assert!(ReceiptStatus::Failed.is_terminal());
        assert!(ReceiptStatus::ParseFailed.is_terminal());
        assert!(!ReceiptStatus::Uploaded.is_terminal());
        assert!(!ReceiptStatus::OcrInProgress.is_terminal());
        assert!(!ReceiptStatus::OcrCompleted.is_terminal());
    }
}
