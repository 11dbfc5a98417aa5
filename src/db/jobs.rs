use crate::models::job::{job_status, ReceiptJob};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Enqueue a processing job for a receipt, due immediately
pub async fn enqueue_job(pool: &PgPool, receipt_id: Uuid) -> Result<Uuid, sqlx::Error> {
    let job_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO receipt_jobs (id, receipt_id, status, attempts, next_run_at)
        VALUES ($1, $2, $3, 0, now())
        "#,
    )
    .bind(job_id)
    .bind(receipt_id)
    .bind(job_status::PENDING)
    .execute(pool)
    .await?;
    Ok(job_id)
}

/// Claim the oldest due pending job, or take over a stale claim. SKIP
/// LOCKED keeps concurrent workers from grabbing the same row.
///
/// A `running` row whose `updated_at` is older than the claim timeout
/// belongs to a worker that died (or a process that restarted) between
/// claim and settle; it is claimable again, so no job is ever stranded.
pub async fn claim_due_job(
    pool: &PgPool,
    claim_timeout_secs: u64,
) -> Result<Option<ReceiptJob>, sqlx::Error> {
    sqlx::query_as::<_, ReceiptJob>(
        r#"
        UPDATE receipt_jobs
        SET status = $1, updated_at = now()
        WHERE id = (
            SELECT id FROM receipt_jobs
            WHERE (status = $2 AND next_run_at <= now())
               OR (status = $1 AND updated_at < $3)
            ORDER BY next_run_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING id, receipt_id, status, attempts, next_run_at,
                  last_error, created_at, updated_at
        "#,
    )
    .bind(job_status::RUNNING)
    .bind(job_status::PENDING)
    .bind(stale_claim_cutoff(claim_timeout_secs, Utc::now()))
    .fetch_optional(pool)
    .await
}

/// Claims last touched before this instant are considered abandoned.
/// A timeout too large to represent means nothing is ever reclaimed.
fn stale_claim_cutoff(claim_timeout_secs: u64, now: DateTime<Utc>) -> DateTime<Utc> {
    let timeout = claim_timeout_secs.min(i64::MAX as u64) as i64;
    Duration::try_seconds(timeout)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Dead-letter any pending job for a receipt; used when a reprocess
/// supersedes the outstanding retry chain. Returns the number cancelled
pub async fn cancel_pending_jobs(pool: &PgPool, receipt_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE receipt_jobs
        SET status = $2, last_error = 'superseded by reprocess', updated_at = now()
        WHERE receipt_id = $1 AND status = $3
        "#,
    )
    .bind(receipt_id)
    .bind(job_status::DEAD)
    .bind(job_status::PENDING)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Whether a worker currently holds a claim on this receipt
pub async fn has_running_job(pool: &PgPool, receipt_id: Uuid) -> Result<bool, sqlx::Error> {
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT exists(SELECT 1 FROM receipt_jobs WHERE receipt_id = $1 AND status = $2)",
    )
    .bind(receipt_id)
    .bind(job_status::RUNNING)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Put a failed job back in the queue with a later due time
pub async fn reschedule_job(
    pool: &PgPool,
    job_id: Uuid,
    delay_secs: u64,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE receipt_jobs
        SET status = $2, attempts = attempts + 1,
            next_run_at = $3, last_error = $4, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(job_status::PENDING)
    .bind(Utc::now() + Duration::seconds(delay_secs as i64))
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn complete_job(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    finish_job(pool, job_id, job_status::COMPLETED, None).await
}

/// Dead-letter a job: the retry budget is spent or the failure is fatal
pub async fn dead_letter_job(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
) -> Result<(), sqlx::Error> {
    finish_job(pool, job_id, job_status::DEAD, Some(error)).await
}

async fn finish_job(
    pool: &PgPool,
    job_id: Uuid,
    status: &str,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE receipt_jobs
        SET status = $2, attempts = attempts + 1,
            last_error = coalesce($3, last_error), updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(status)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove completed and dead rows older than the retention window;
/// returns the number pruned
pub async fn prune_finished_jobs(
    pool: &PgPool,
    older_than_days: i64,
) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(older_than_days);
    let result = sqlx::query(
        r#"
        DELETE FROM receipt_jobs
        WHERE status IN ($1, $2) AND updated_at < $3
        "#,
    )
    .bind(job_status::COMPLETED)
    .bind(job_status::DEAD)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_cutoff_is_timeout_in_the_past() {
        let now = Utc::now();
        let cutoff = stale_claim_cutoff(600, now);
        assert_eq!(now - cutoff, Duration::seconds(600));
    }

    #[test]
    fn zero_timeout_reclaims_anything_not_just_touched() {
        let now = Utc::now();
        assert_eq!(stale_claim_cutoff(0, now), now);
    }

    #[test]
    fn oversized_timeout_does_not_overflow() {
        let cutoff = stale_claim_cutoff(u64::MAX, Utc::now());
        assert!(cutoff < Utc::now());
    }
}
