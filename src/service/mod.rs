pub mod ocr;
pub mod parser;
pub mod receipts;

pub use ocr::{OcrClient, OcrError};
pub use receipts::{ItemEdit, ReceiptService};
