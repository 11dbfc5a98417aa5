use crate::config::JobsConfig;
use crate::db::{jobs, queries};
use crate::models::{OcrAudit, ParsedReceipt, Receipt, ReceiptStatus};
use crate::notify::StatusHub;
use crate::service::ocr::{OcrClient, OcrError};
use crate::service::parser::parse_receipt_text;
use crate::storage::FileStore;
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Explicit result of one whole-job execution. The worker loop inspects
/// this instead of catching arbitrary errors, so retryable vs. fatal is a
/// visible, testable decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Transient failure; the outer policy may reattempt the whole job.
    Retry(String),
    /// Reattempting cannot help; dead-letter the job immediately.
    Fatal(String),
}

/// Whole-job retry schedule. The delay table drives both the budget and
/// the spacing: one more execution per entry, then dead.
#[derive(Debug, Clone)]
pub struct OuterRetryPolicy {
    delays_secs: Vec<u64>,
}

impl OuterRetryPolicy {
    pub fn new(delays_secs: Vec<u64>) -> Self {
        Self { delays_secs }
    }

    /// Delay before the next execution, given how many executions have
    /// already failed. None means the budget is spent.
    pub fn delay_after(&self, failed_executions: i32) -> Option<u64> {
        if failed_executions < 1 {
            return self.delays_secs.first().copied();
        }
        self.delays_secs.get(failed_executions as usize - 1).copied()
    }
}

/// Receipt persistence as the pipeline sees it: load, the in-progress
/// transition, the two terminal writes. The live implementation is
/// Postgres; tests script it, same as the OCR transport seam.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    async fn load(&self, receipt_id: Uuid) -> Result<Option<Receipt>, sqlx::Error>;
    async fn mark_in_progress(&self, receipt_id: Uuid) -> Result<(), sqlx::Error>;
    async fn mark_failed(&self, receipt_id: Uuid, message: &str) -> Result<(), sqlx::Error>;
    async fn persist_results(
        &self,
        receipt_id: Uuid,
        parsed: &ParsedReceipt,
        confidence: f64,
    ) -> Result<(), sqlx::Error>;
}

/// The Postgres-backed store used in production; thin glue over the
/// query layer.
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn load(&self, receipt_id: Uuid) -> Result<Option<Receipt>, sqlx::Error> {
        queries::get_receipt_unscoped(&self.pool, receipt_id).await
    }

    async fn mark_in_progress(&self, receipt_id: Uuid) -> Result<(), sqlx::Error> {
        queries::set_receipt_status(&self.pool, receipt_id, ReceiptStatus::OcrInProgress, None)
            .await
    }

    async fn mark_failed(&self, receipt_id: Uuid, message: &str) -> Result<(), sqlx::Error> {
        queries::mark_receipt_failed(&self.pool, receipt_id, message).await
    }

    async fn persist_results(
        &self,
        receipt_id: Uuid,
        parsed: &ParsedReceipt,
        confidence: f64,
    ) -> Result<(), sqlx::Error> {
        queries::apply_parse_result(&self.pool, receipt_id, parsed, confidence).await
    }
}

/// Everything one worker needs; built once in main and shared.
pub struct ProcessingContext {
    /// Job-queue settlement only; receipt rows go through `store`.
    pub pool: PgPool,
    pub store: Arc<dyn ReceiptStore>,
    pub storage: FileStore,
    pub ocr: OcrClient,
    pub hub: Arc<StatusHub>,
}

/// Spawn the bounded worker pool. Small on purpose: concurrency here is
/// what the OCR provider's rate limit sees.
pub fn spawn_workers(ctx: Arc<ProcessingContext>, config: &JobsConfig) -> Vec<JoinHandle<()>> {
    let policy = OuterRetryPolicy::new(config.retry_delays_secs.clone());
    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let claim_timeout_secs = config.claim_timeout_secs;

    (0..config.workers.max(1))
        .map(|worker_id| {
            let ctx = ctx.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                info!(worker_id, "receipt worker started");
                worker_loop(worker_id, ctx, policy, poll_interval, claim_timeout_secs).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<ProcessingContext>,
    policy: OuterRetryPolicy,
    poll_interval: Duration,
    claim_timeout_secs: u64,
) {
    loop {
        let job = match jobs::claim_due_job(&ctx.pool, claim_timeout_secs).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(poll_interval).await;
                continue;
            }
            Err(e) => {
                error!(worker_id, "failed to claim job: {}", e);
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        info!(
            worker_id,
            job_id = %job.id,
            receipt_id = %job.receipt_id,
            attempt = job.attempts + 1,
            "processing receipt"
        );

        let outcome = process_receipt(&ctx, job.receipt_id).await;
        let settle = match &outcome {
            JobOutcome::Completed => jobs::complete_job(&ctx.pool, job.id).await,
            JobOutcome::Fatal(message) => {
                warn!(job_id = %job.id, "fatal job failure: {}", message);
                jobs::dead_letter_job(&ctx.pool, job.id, message).await
            }
            JobOutcome::Retry(message) => match policy.delay_after(job.attempts + 1) {
                Some(delay_secs) => {
                    warn!(
                        job_id = %job.id,
                        delay_secs,
                        "job failed, rescheduling: {}", message
                    );
                    jobs::reschedule_job(&ctx.pool, job.id, delay_secs, message).await
                }
                None => {
                    warn!(job_id = %job.id, "retry budget spent: {}", message);
                    jobs::dead_letter_job(&ctx.pool, job.id, message).await
                }
            },
        };

        if let Err(e) = settle {
            error!(job_id = %job.id, "failed to settle job row: {}", e);
        }
    }
}

/// One whole-job execution of the OCR + parse pipeline for one receipt.
/// Persistence failures and provider trouble come back as `Retry`;
/// conditions a rerun cannot fix come back as `Fatal`. Receipt status is
/// always settled before returning, so callers above never interpret raw
/// provider errors.
pub async fn process_receipt(ctx: &ProcessingContext, receipt_id: Uuid) -> JobOutcome {
    // Entry contract: the record must still exist and decode cleanly.
    let receipt = match ctx.store.load(receipt_id).await {
        Ok(Some(receipt)) => receipt,
        Ok(None) => {
            return JobOutcome::Fatal(format!("receipt {} no longer exists", receipt_id));
        }
        Err(e) => return JobOutcome::Retry(format!("loading receipt: {}", e)),
    };
    if let Err(bad) = receipt.status() {
        return JobOutcome::Fatal(format!("receipt {}: {}", receipt_id, bad));
    }

    // Externally observable mid-flight: persist before doing any work.
    if let Err(e) = ctx.store.mark_in_progress(receipt_id).await {
        return JobOutcome::Retry(format!("marking in progress: {}", e));
    }
    ctx.hub.status_updated(
        receipt_id,
        ReceiptStatus::OcrInProgress,
        Some("OCR started".into()),
    );

    // Resolve the image before spending an OCR call on it.
    if !ctx.storage.exists(&receipt.image_path).await {
        let message = format!("image file missing: {}", receipt.image_path);
        return fail_receipt(ctx, receipt_id, message, false).await;
    }
    let image = match ctx.storage.read(&receipt.image_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let message = format!("reading image {}: {}", receipt.image_path, e);
            return fail_receipt(ctx, receipt_id, message, false).await;
        }
    };

    let ocr_text = match ctx.ocr.recognize(&image).await {
        Ok(text) => text,
        Err(err @ OcrError::NotConfigured) | Err(err @ OcrError::NoText) => {
            // Deterministic failures; a rerun changes nothing.
            return fail_receipt(ctx, receipt_id, err.to_string(), true).await;
        }
        Err(err @ OcrError::Provider(_)) => {
            return fail_receipt(ctx, receipt_id, err.to_string(), false).await;
        }
    };

    let parsed = parse_receipt_text(&ocr_text.raw_text);
    let item_count = parsed.items.len();

    if let Err(e) = ctx
        .store
        .persist_results(receipt_id, &parsed, ocr_text.confidence)
        .await
    {
        return fail_receipt(ctx, receipt_id, format!("persisting results: {}", e), false).await;
    }

    // Audit artifact is best effort; losing it must not fail the job.
    let audit = OcrAudit {
        raw_text: ocr_text.raw_text.clone(),
        confidence: ocr_text.confidence,
        parsed: parsed.clone(),
    };
    if let Err(e) = ctx.storage.store_audit(receipt_id, &audit).await {
        warn!(%receipt_id, "failed to write OCR audit artifact: {}", e);
    }

    info!(
        %receipt_id,
        item_count,
        confidence = ocr_text.confidence,
        "receipt processed"
    );
    ctx.hub.processing_complete(
        receipt_id,
        ReceiptStatus::Ready,
        item_count,
        Some(ocr_text.confidence),
    );

    JobOutcome::Completed
}

/// Settle the receipt in Failed, notify watchers, then hand the worker
/// loop the matching outcome.
async fn fail_receipt(
    ctx: &ProcessingContext,
    receipt_id: Uuid,
    message: String,
    fatal: bool,
) -> JobOutcome {
    if let Err(e) = ctx.store.mark_failed(receipt_id, &message).await {
        error!(%receipt_id, "failed to persist failure state: {}", e);
        return JobOutcome::Retry(format!("persisting failure state: {}", e));
    }
    ctx.hub
        .processing_complete(receipt_id, ReceiptStatus::Failed, 0, None);

    if fatal {
        JobOutcome::Fatal(message)
    } else {
        JobOutcome::Retry(message)
    }
}
