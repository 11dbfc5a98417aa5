use crate::db::{jobs, queries};
use crate::error::AppError;
use crate::models::{OcrAudit, Receipt, ReceiptLineItem, ReceiptStatus};
use crate::storage::FileStore;
use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "pdf"];

/// One item edit in an update-items request.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemEdit {
    pub id: Uuid,
    pub name: String,
    pub price: BigDecimal,
    pub quantity: i32,
}

/// Receipt orchestrator: upload, reads, item edits, delete, reprocess.
/// Thin glue over the query layer; all processing happens in the workers.
pub struct ReceiptService {
    pool: PgPool,
    storage: FileStore,
}

impl ReceiptService {
    pub fn new(pool: PgPool, storage: FileStore) -> Self {
        Self { pool, storage }
    }

    /// Synchronous upload path: validate, persist blob + row, enqueue.
    /// Returns before any OCR work happens.
    pub async fn upload(
        &self,
        user_id: Uuid,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(Receipt, Uuid), AppError> {
        let extension = validate_upload(filename, bytes.len())?;

        let image_path = self.storage.store_image(bytes, &extension).await?;
        let receipt = Receipt {
            id: Uuid::new_v4(),
            user_id,
            merchant_name: None,
            transaction_date: None,
            subtotal: None,
            tax_amount: None,
            tip_amount: None,
            total_amount: None,
            image_path,
            status: ReceiptStatus::Uploaded.as_str().to_string(),
            ocr_confidence: None,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
        };

        if let Err(e) = queries::insert_receipt(&self.pool, &receipt).await {
            self.discard_failed_upload(&receipt, false).await;
            return Err(e.into());
        }
        let job_id = match jobs::enqueue_job(&self.pool, receipt.id).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.discard_failed_upload(&receipt, true).await;
                return Err(e.into());
            }
        };

        info!(
            receipt_id = %receipt.id,
            %user_id,
            %job_id,
            size = bytes.len(),
            "receipt uploaded and queued"
        );
        Ok((receipt, job_id))
    }

    /// Best-effort rollback of a half-finished upload, so a failed insert
    /// or enqueue leaves neither an orphaned blob nor an unqueued row.
    async fn discard_failed_upload(&self, receipt: &Receipt, row_inserted: bool) {
        if let Err(e) = self.storage.delete(&receipt.image_path).await {
            warn!(receipt_id = %receipt.id, "failed to remove orphaned upload blob: {}", e);
        }
        if row_inserted {
            if let Err(e) = queries::delete_receipt(&self.pool, receipt.id, receipt.user_id).await {
                warn!(receipt_id = %receipt.id, "failed to remove unqueued receipt row: {}", e);
            }
        }
    }

    /// Page through a user's receipts, newest first. Page size capped.
    pub async fn list(
        &self,
        user_id: Uuid,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Receipt>, i64), AppError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let offset = (page - 1) * page_size;

        let receipts = queries::list_receipts(&self.pool, user_id, page_size, offset).await?;
        let total = queries::count_receipts(&self.pool, user_id).await?;
        Ok((receipts, total))
    }

    /// Receipt plus its items; the polling fallback reads this.
    pub async fn get(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
    ) -> Result<(Receipt, Vec<ReceiptLineItem>), AppError> {
        let receipt = queries::get_receipt(&self.pool, receipt_id, user_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let items = queries::list_items(&self.pool, receipt_id).await?;
        Ok((receipt, items))
    }

    /// Apply item edits and recompute the receipt total from the full
    /// current item set in the same transaction. Untouched items keep
    /// their values and still count toward the total.
    pub async fn update_items(
        &self,
        user_id: Uuid,
        receipt_id: Uuid,
        edits: &[ItemEdit],
    ) -> Result<(Receipt, Vec<ReceiptLineItem>), AppError> {
        queries::get_receipt(&self.pool, receipt_id, user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let mut items = queries::list_items(&self.pool, receipt_id).await?;
        let total = apply_edits(&mut items, edits)?;

        let mut tx = self.pool.begin().await?;
        for edit in edits {
            let updated = queries::update_item(
                &mut *tx,
                receipt_id,
                edit.id,
                &edit.name,
                &edit.price,
                edit.quantity,
            )
            .await?;
            if !updated {
                // Item disappeared between the read and the write.
                return Err(AppError::NotFound);
            }
        }
        queries::set_receipt_total(&mut *tx, receipt_id, &total).await?;
        tx.commit().await?;

        self.get(user_id, receipt_id).await
    }

    /// Reset a receipt and queue a fresh processing job. The usual way
    /// out of a permanent Failed state.
    pub async fn reprocess(&self, user_id: Uuid, receipt_id: Uuid) -> Result<Uuid, AppError> {
        queries::get_receipt(&self.pool, receipt_id, user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        // One job chain per receipt. A worker holding a claim keeps its
        // single forward-moving status sequence, so refuse; a queued
        // retry is superseded by the fresh job and gets dead-lettered.
        if jobs::has_running_job(&self.pool, receipt_id).await? {
            return Err(AppError::Validation(
                "receipt is currently being processed".into(),
            ));
        }
        let cancelled = jobs::cancel_pending_jobs(&self.pool, receipt_id).await?;
        if cancelled > 0 {
            info!(%receipt_id, cancelled, "cancelled queued jobs superseded by reprocess");
        }

        queries::reset_for_reprocess(&self.pool, receipt_id).await?;
        let job_id = jobs::enqueue_job(&self.pool, receipt_id).await?;
        info!(%receipt_id, %job_id, "receipt queued for reprocessing");
        Ok(job_id)
    }

    /// Delete the receipt row (items cascade) and its stored artifacts.
    pub async fn delete(&self, user_id: Uuid, receipt_id: Uuid) -> Result<(), AppError> {
        let image_path = queries::delete_receipt(&self.pool, receipt_id, user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        // Blob cleanup is best effort; the row is already gone.
        if let Err(e) = self.storage.delete(&image_path).await {
            warn!(%receipt_id, "failed to delete receipt image: {}", e);
        }
        if let Err(e) = self.storage.delete_audit(receipt_id).await {
            warn!(%receipt_id, "failed to delete OCR audit artifact: {}", e);
        }
        Ok(())
    }

    /// Raw OCR debug artifact, when one was written and still retained.
    pub async fn ocr_debug(&self, user_id: Uuid, receipt_id: Uuid) -> Result<OcrAudit, AppError> {
        queries::get_receipt(&self.pool, receipt_id, user_id)
            .await?
            .ok_or(AppError::NotFound)?;

        self.storage
            .read_audit(receipt_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Ownership check for the WS subscribe path.
    pub async fn owns_receipt(&self, user_id: Uuid, receipt_id: Uuid) -> Result<bool, AppError> {
        Ok(queries::get_receipt(&self.pool, receipt_id, user_id)
            .await?
            .is_some())
    }
}

/// Apply edits to the loaded item set, then recompute the receipt total
/// as `Σ price × quantity` over every current item, edited or not.
/// Pure; the caller writes both the items and the total in one
/// transaction.
fn apply_edits(items: &mut [ReceiptLineItem], edits: &[ItemEdit]) -> Result<BigDecimal, AppError> {
    for edit in edits {
        if edit.price < BigDecimal::zero() {
            return Err(AppError::Validation(format!(
                "item {} price must not be negative",
                edit.id
            )));
        }
        if edit.quantity < 1 {
            return Err(AppError::Validation(format!(
                "item {} quantity must be at least 1",
                edit.id
            )));
        }
        let item = items
            .iter_mut()
            .find(|item| item.id == edit.id)
            .ok_or(AppError::NotFound)?;
        item.name = edit.name.clone();
        item.price = edit.price.clone();
        item.quantity = edit.quantity;
    }

    Ok(items.iter().fold(BigDecimal::zero(), |total, item| {
        total + &item.price * BigDecimal::from(item.quantity)
    }))
}

/// Upload validation; returns the normalized extension.
fn validate_upload(filename: &str, size: usize) -> Result<String, AppError> {
    if size == 0 {
        return Err(AppError::Validation("uploaded file is empty".into()));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(AppError::Validation(format!(
            "file exceeds the {} MB limit",
            MAX_UPLOAD_BYTES / (1024 * 1024)
        )));
    }

    let extension = filename
        .rsplit('.')
        .next()
        .filter(|ext| *ext != filename)
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AppError::Validation(format!(
            "unsupported file type: {:?}",
            filename
        )));
    }
    Ok(extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn item(name: &str, price: &str, quantity: i32) -> ReceiptLineItem {
        ReceiptLineItem {
            id: Uuid::new_v4(),
            receipt_id: Uuid::nil(),
            name: name.to_string(),
            price: BigDecimal::from_str(price).unwrap(),
            quantity,
            line_number: 1,
        }
    }

    fn edit_of(item: &ReceiptLineItem, price: &str, quantity: i32) -> ItemEdit {
        ItemEdit {
            id: item.id,
            name: item.name.clone(),
            price: BigDecimal::from_str(price).unwrap(),
            quantity,
        }
    }

    #[test]
    fn total_counts_unedited_items_too() {
        let mut items = vec![item("Milk", "3.99", 1), item("Bread", "2.50", 2)];
        let edits = vec![edit_of(&items[0], "4.99", 1)];

        let total = apply_edits(&mut items, &edits).unwrap();
        // 4.99 + 2.50 × 2
        assert_eq!(total, BigDecimal::from_str("9.99").unwrap());
        assert_eq!(items[0].price, BigDecimal::from_str("4.99").unwrap());
        assert_eq!(items[1].price, BigDecimal::from_str("2.50").unwrap());
    }

    #[test]
    fn empty_edit_list_recomputes_over_current_items() {
        let mut items = vec![item("Milk", "3.99", 2)];
        let total = apply_edits(&mut items, &[]).unwrap();
        assert_eq!(total, BigDecimal::from_str("7.98").unwrap());
    }

    #[test]
    fn unknown_item_id_is_not_found() {
        let mut items = vec![item("Milk", "3.99", 1)];
        let stray = ItemEdit {
            id: Uuid::new_v4(),
            name: "Eggs".into(),
            price: BigDecimal::from_str("1.00").unwrap(),
            quantity: 1,
        };
        assert!(matches!(
            apply_edits(&mut items, &[stray]),
            Err(AppError::NotFound)
        ));
    }

    #[test]
    fn rejects_negative_price_and_zero_quantity() {
        let mut items = vec![item("Milk", "3.99", 1)];
        let bad_price = edit_of(&items[0], "-1.00", 1);
        assert!(matches!(
            apply_edits(&mut items, std::slice::from_ref(&bad_price)),
            Err(AppError::Validation(_))
        ));

        let bad_quantity = edit_of(&items[0], "3.99", 0);
        assert!(matches!(
            apply_edits(&mut items, std::slice::from_ref(&bad_quantity)),
            Err(AppError::Validation(_))
        ));
        // Failed edits leave the item set untouched.
        assert_eq!(items[0].price, BigDecimal::from_str("3.99").unwrap());
    }

    #[test]
    fn accepts_known_image_types() {
        for name in ["a.jpg", "b.JPEG", "c.png", "d.webp", "e.pdf"] {
            assert!(validate_upload(name, 100).is_ok(), "{}", name);
        }
    }

    #[test]
    fn rejects_unknown_extensions_and_missing_ones() {
        assert!(validate_upload("malware.exe", 100).is_err());
        assert!(validate_upload("noextension", 100).is_err());
        assert!(validate_upload("archive.tar.gz", 100).is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_files() {
        assert!(validate_upload("a.jpg", 0).is_err());
        assert!(validate_upload("a.jpg", MAX_UPLOAD_BYTES + 1).is_err());
        assert!(validate_upload("a.jpg", MAX_UPLOAD_BYTES).is_ok());
    }
}
