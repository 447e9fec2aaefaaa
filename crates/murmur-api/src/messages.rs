use axum::{Extension, Json, extract::State, response::IntoResponse};

use murmur_types::api::{ApiResponse, HistoryResponse};
use murmur_types::models::Identity;

use crate::auth::AppState;
use crate::error::{ApiError, blocking};

/// GET /message/history: every archived message, oldest first.
///
/// History is replayed only on request; new realtime connections are not
/// sent a backlog.
pub async fn get_history(
    State(state): State<AppState>,
    Extension(_identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let messages: HistoryResponse = blocking(move || {
        state
            .archive
            .list_all()
            .map_err(|e| ApiError::internal("Internal Server Error", e))
    })
    .await?;

    Ok(Json(ApiResponse::ok(messages)))
}
