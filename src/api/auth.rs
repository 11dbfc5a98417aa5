use crate::api::AppState;
use crate::db::queries;
use crate::error::AppError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

/// The validated identity behind a request. The token store issues the
/// opaque credential; this extractor only resolves it, never mints it.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        let user_id = queries::lookup_token(&state.pool, token)
            .await?
            .ok_or(AppError::Unauthorized)?;
        Ok(CurrentUser(user_id))
    }
}
