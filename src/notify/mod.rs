pub mod hub;

pub use hub::{ReceiptEvent, StatusHub};
