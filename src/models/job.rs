use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Durable queue row (receipt_jobs). One row per enqueued processing
/// attempt chain; `attempts` counts whole-job executions.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReceiptJob {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue-row states. `dead` means the retry budget is spent and no
/// further automatic execution happens.
pub mod job_status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const DEAD: &str = "dead";
}
