pub mod job;
pub mod ocr;
pub mod receipt;

pub use job::ReceiptJob;
pub use ocr::{OcrAudit, OcrText, ParsedLineItem, ParsedReceipt};
pub use receipt::{Receipt, ReceiptLineItem, ReceiptStatus};
