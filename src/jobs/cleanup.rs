use crate::config::{JobsConfig, StorageConfig};
use crate::db::jobs;
use crate::storage::FileStore;
use sqlx::PgPool;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Recurring cleanup: stale OCR audit artifacts and finished queue rows.
/// Failures are logged and the loop keeps running; the next tick retries.
pub fn spawn_cleanup_task(
    pool: PgPool,
    storage: FileStore,
    storage_config: &StorageConfig,
    jobs_config: &JobsConfig,
) -> JoinHandle<()> {
    let retention_days = storage_config.audit_retention_days;
    let interval = Duration::from_secs(jobs_config.cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            run_cleanup(&pool, &storage, retention_days).await;
        }
    })
}

async fn run_cleanup(pool: &PgPool, storage: &FileStore, retention_days: i64) {
    match storage.delete_stale_audits(retention_days).await {
        Ok(removed) if removed > 0 => {
            info!(removed, retention_days, "removed stale OCR audit artifacts")
        }
        Ok(_) => {}
        Err(e) => warn!("audit cleanup failed, will retry next run: {}", e),
    }

    match jobs::prune_finished_jobs(pool, retention_days).await {
        Ok(pruned) if pruned > 0 => info!(pruned, "pruned finished job rows"),
        Ok(_) => {}
        Err(e) => warn!("job pruning failed, will retry next run: {}", e),
    }
}
