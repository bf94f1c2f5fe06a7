//! Pending export queue endpoints.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use convoy_core::{FlushReport, PendingExport};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::AppState;

/// Creates the uploads router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_pending_uploads))
        .route("/flush", post(flush_uploads))
}

/// Exports waiting for a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PendingUploadsResponse {
    /// Queued snapshots in enqueue order.
    pub pending: Vec<PendingExport>,

    /// Number of queued snapshots.
    #[schema(example = 1)]
    pub count: usize,
}

/// List queued exports.
#[utoipa::path(
    get,
    path = "/api/uploads",
    tag = "uploads",
    operation_id = "getPendingUploads",
    summary = "List pending exports",
    description = "Returns the session exports whose upload failed. They are \
        retried on a fixed interval until they succeed.",
    responses(
        (status = 200, description = "Pending exports", body = PendingUploadsResponse)
    )
)]
pub async fn get_pending_uploads(
    State(state): State<AppState>,
) -> ApiResult<Json<PendingUploadsResponse>> {
    let pending = state.uploads().pending().await?;
    Ok(Json(PendingUploadsResponse {
        count: pending.len(),
        pending,
    }))
}

/// Retry every queued export now.
#[utoipa::path(
    post,
    path = "/api/uploads/flush",
    tag = "uploads",
    operation_id = "flushUploads",
    summary = "Retry pending exports now",
    description = "Tries every queued export once, in order, and removes exactly \
        the ones that uploaded.",
    responses(
        (status = 200, description = "Flush pass finished", body = FlushReport)
    )
)]
pub async fn flush_uploads(State(state): State<AppState>) -> ApiResult<Json<FlushReport>> {
    Ok(Json(state.uploads().flush().await?))
}
