pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod service;
pub mod storage;

pub use config::AppConfig;
pub use db::create_pool;
pub use error::AppError;
pub use notify::StatusHub;
pub use service::{OcrClient, ReceiptService};
pub use storage::FileStore;
