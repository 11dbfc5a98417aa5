use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Raw provider output: the recognized text plus the averaged per-word
/// confidence, before any structure is extracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrText {
    pub raw_text: String,
    pub confidence: f64,
}

/// One line item recognized by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLineItem {
    pub name: String,
    pub price: BigDecimal,
    pub quantity: i32,
    /// 1-based position of the source line on the receipt.
    pub line_number: i32,
    pub confidence: f64,
}

/// Structured parse of one receipt. Transient; serialized to the audit
/// blob but never persisted as its own table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedReceipt {
    pub merchant_name: Option<String>,
    pub transaction_date: Option<NaiveDate>,
    pub subtotal: Option<BigDecimal>,
    pub tax_amount: Option<BigDecimal>,
    pub tip_amount: Option<BigDecimal>,
    pub total_amount: Option<BigDecimal>,
    pub items: Vec<ParsedLineItem>,
}

/// Audit artifact written next to the receipt image: the raw provider
/// text plus what the parser made of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrAudit {
    pub raw_text: String,
    pub confidence: f64,
    pub parsed: ParsedReceipt,
}
