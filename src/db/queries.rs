use crate::models::{ParsedReceipt, Receipt, ReceiptLineItem, ReceiptStatus};
use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

/// Insert a freshly uploaded receipt
pub async fn insert_receipt(pool: &PgPool, receipt: &Receipt) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO receipts (id, user_id, image_path, status, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(receipt.id)
    .bind(receipt.user_id)
    .bind(&receipt.image_path)
    .bind(&receipt.status)
    .bind(receipt.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a receipt scoped to its owner; a non-owner gets None, same as a
/// missing row
pub async fn get_receipt(
    pool: &PgPool,
    receipt_id: Uuid,
    user_id: Uuid,
) -> Result<Option<Receipt>, sqlx::Error> {
    sqlx::query_as::<_, Receipt>(
        r#"
        SELECT id, user_id, merchant_name, transaction_date,
               subtotal, tax_amount, tip_amount, total_amount,
               image_path, status, ocr_confidence, error_message,
               created_at, processed_at
        FROM receipts
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(receipt_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

/// Fetch a receipt by id only; used by the job runner, which is trusted
pub async fn get_receipt_unscoped(
    pool: &PgPool,
    receipt_id: Uuid,
) -> Result<Option<Receipt>, sqlx::Error> {
    sqlx::query_as::<_, Receipt>(
        r#"
        SELECT id, user_id, merchant_name, transaction_date,
               subtotal, tax_amount, tip_amount, total_amount,
               image_path, status, ocr_confidence, error_message,
               created_at, processed_at
        FROM receipts
        WHERE id = $1
        "#,
    )
    .bind(receipt_id)
    .fetch_optional(pool)
    .await
}

/// List a user's receipts, newest first
pub async fn list_receipts(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<Receipt>, sqlx::Error> {
    sqlx::query_as::<_, Receipt>(
        r#"
        SELECT id, user_id, merchant_name, transaction_date,
               subtotal, tax_amount, tip_amount, total_amount,
               image_path, status, ocr_confidence, error_message,
               created_at, processed_at
        FROM receipts
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn count_receipts(pool: &PgPool, user_id: Uuid) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM receipts WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Move a receipt to a new status; error message cleared unless provided
pub async fn set_receipt_status(
    pool: &PgPool,
    receipt_id: Uuid,
    status: ReceiptStatus,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE receipts
        SET status = $2, error_message = $3
        WHERE id = $1
        "#,
    )
    .bind(receipt_id)
    .bind(status.as_str())
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal failure: status, message and processed_at in one write
pub async fn mark_receipt_failed(
    pool: &PgPool,
    receipt_id: Uuid,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE receipts
        SET status = $2, error_message = $3, processed_at = $4
        WHERE id = $1
        "#,
    )
    .bind(receipt_id)
    .bind(ReceiptStatus::Failed.as_str())
    .bind(message)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a successful parse: scalar fields, wholesale item replacement
/// and the Ready transition, all in one transaction
pub async fn apply_parse_result(
    pool: &PgPool,
    receipt_id: Uuid,
    parsed: &ParsedReceipt,
    confidence: f64,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE receipts
        SET merchant_name = $2, transaction_date = $3,
            subtotal = $4, tax_amount = $5, tip_amount = $6, total_amount = $7,
            ocr_confidence = $8, status = $9, error_message = NULL,
            processed_at = $10
        WHERE id = $1
        "#,
    )
    .bind(receipt_id)
    .bind(&parsed.merchant_name)
    .bind(parsed.transaction_date)
    .bind(&parsed.subtotal)
    .bind(&parsed.tax_amount)
    .bind(&parsed.tip_amount)
    .bind(&parsed.total_amount)
    .bind(confidence)
    .bind(ReceiptStatus::Ready.as_str())
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM receipt_items WHERE receipt_id = $1")
        .bind(receipt_id)
        .execute(&mut *tx)
        .await?;

    if !parsed.items.is_empty() {
        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO receipt_items (id, receipt_id, name, price, quantity, line_number) ",
        );
        query_builder.push_values(&parsed.items, |mut b, item| {
            b.push_bind(Uuid::new_v4())
                .push_bind(receipt_id)
                .push_bind(&item.name)
                .push_bind(&item.price)
                .push_bind(item.quantity)
                .push_bind(item.line_number);
        });
        query_builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_items(
    pool: &PgPool,
    receipt_id: Uuid,
) -> Result<Vec<ReceiptLineItem>, sqlx::Error> {
    sqlx::query_as::<_, ReceiptLineItem>(
        r#"
        SELECT id, receipt_id, name, price, quantity, line_number
        FROM receipt_items
        WHERE receipt_id = $1
        ORDER BY line_number ASC
        "#,
    )
    .bind(receipt_id)
    .fetch_all(pool)
    .await
}

/// Edit one existing item; returns false when the item does not belong to
/// the receipt
pub async fn update_item<'e, E: PgExecutor<'e>>(
    executor: E,
    receipt_id: Uuid,
    item_id: Uuid,
    name: &str,
    price: &BigDecimal,
    quantity: i32,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE receipt_items
        SET name = $3, price = $4, quantity = $5
        WHERE id = $2 AND receipt_id = $1
        "#,
    )
    .bind(receipt_id)
    .bind(item_id)
    .bind(name)
    .bind(price)
    .bind(quantity)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Write the recomputed receipt total. Runs inside the same transaction
/// as the item edits so readers never see a stale total
pub async fn set_receipt_total<'e, E: PgExecutor<'e>>(
    executor: E,
    receipt_id: Uuid,
    total: &BigDecimal,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE receipts SET total_amount = $2 WHERE id = $1")
        .bind(receipt_id)
        .bind(total)
        .execute(executor)
        .await?;
    Ok(())
}

/// Reset a receipt for user-triggered reprocessing
pub async fn reset_for_reprocess(pool: &PgPool, receipt_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE receipts
        SET status = $2, error_message = NULL, processed_at = NULL
        WHERE id = $1
        "#,
    )
    .bind(receipt_id)
    .bind(ReceiptStatus::Uploaded.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a receipt (items cascade); returns the image path for blob
/// cleanup when a row was actually removed
pub async fn delete_receipt(
    pool: &PgPool,
    receipt_id: Uuid,
    user_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        DELETE FROM receipts
        WHERE id = $1 AND user_id = $2
        RETURNING image_path
        "#,
    )
    .bind(receipt_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(path,)| path))
}

/// Resolve an opaque bearer token to its user
pub async fn lookup_token(pool: &PgPool, token: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT user_id FROM api_tokens WHERE token = $1")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(user_id,)| user_id))
}
