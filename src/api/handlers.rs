use crate::api::auth::CurrentUser;
use crate::api::AppState;
use crate::error::AppError;
use crate::models::{OcrAudit, Receipt, ReceiptLineItem};
use crate::service::ItemEdit;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upload response: initial status plus the queued job reference.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: Uuid,
    pub status: String,
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ReceiptDetailResponse {
    pub receipt: Receipt,
    pub items: Vec<ReceiptLineItem>,
}

#[derive(Debug, Serialize)]
pub struct ReceiptListResponse {
    pub receipts: Vec<Receipt>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemsRequest {
    pub items: Vec<ItemEdit>,
}

#[derive(Debug, Serialize)]
pub struct ReprocessResponse {
    pub id: Uuid,
    pub status: String,
    pub job_id: Uuid,
}

/// Health check
pub async fn health_check() -> &'static str {
    "OK"
}

/// Multipart upload. Validation failures come back synchronously; the
/// OCR pipeline never runs on this path.
pub async fn upload_receipt(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("malformed multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            let filename = field
                .file_name()
                .map(|f| f.to_string())
                .ok_or_else(|| AppError::Validation("file field has no filename".into()))?;
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::Validation(format!("failed to read upload: {}", e)))?;
            file = Some((filename, bytes.to_vec()));
            break;
        }
    }
    let (filename, bytes) =
        file.ok_or_else(|| AppError::Validation("missing \"file\" field".into()))?;

    let (receipt, job_id) = state.service.upload(user_id, &filename, &bytes).await?;
    let response = UploadResponse {
        id: receipt.id,
        status: receipt.status,
        job_id,
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

/// Paginated list, newest first
pub async fn list_receipts(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(pagination): Query<Pagination>,
) -> Result<Json<ReceiptListResponse>, AppError> {
    let page = pagination.page.unwrap_or(1).max(1);
    let page_size = pagination.page_size.unwrap_or(20).clamp(1, 100);

    let (receipts, total) = state.service.list(user_id, page, page_size).await?;
    Ok(Json(ReceiptListResponse {
        receipts,
        total,
        page,
        page_size,
    }))
}

/// Receipt detail; doubles as the polling fallback and is side-effect
/// free on repeat
pub async fn get_receipt(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(receipt_id): Path<Uuid>,
) -> Result<Json<ReceiptDetailResponse>, AppError> {
    let (receipt, items) = state.service.get(user_id, receipt_id).await?;
    Ok(Json(ReceiptDetailResponse { receipt, items }))
}

/// Edit line items; the receipt total is recomputed over all current
/// items before the response is built
pub async fn update_items(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(receipt_id): Path<Uuid>,
    Json(request): Json<UpdateItemsRequest>,
) -> Result<Json<ReceiptDetailResponse>, AppError> {
    let (receipt, items) = state
        .service
        .update_items(user_id, receipt_id, &request.items)
        .await?;
    Ok(Json(ReceiptDetailResponse { receipt, items }))
}

/// User-triggered reprocess of a (typically Failed) receipt
pub async fn reprocess_receipt(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(receipt_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let job_id = state.service.reprocess(user_id, receipt_id).await?;
    let response = ReprocessResponse {
        id: receipt_id,
        status: crate::models::ReceiptStatus::Uploaded.as_str().to_string(),
        job_id,
    };
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

pub async fn delete_receipt(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(receipt_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.service.delete(user_id, receipt_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Raw OCR debug artifact for a processed receipt
pub async fn get_ocr_debug(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(receipt_id): Path<Uuid>,
) -> Result<Json<OcrAudit>, AppError> {
    let audit = state.service.ocr_debug(user_id, receipt_id).await?;
    Ok(Json(audit))
}
