pub mod auth;
pub mod handlers;
pub mod ws;

use crate::notify::StatusHub;
use crate::service::ReceiptService;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared state handed to every handler. The hub lives here so nothing
/// reaches for a global connection registry.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReceiptService>,
    pub hub: Arc<StatusHub>,
    pub pool: PgPool,
}
