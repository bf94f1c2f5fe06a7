//! Session history, export and local data endpoints.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use convoy_core::{ExportDocument, Session, SessionId};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

/// A list of sessions.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionsResponse {
    /// Sessions ordered oldest first.
    pub sessions: Vec<Session>,

    /// Number of sessions.
    #[schema(example = 3)]
    pub count: usize,
}

impl From<Vec<Session>> for SessionsResponse {
    fn from(sessions: Vec<Session>) -> Self {
        Self {
            count: sessions.len(),
            sessions,
        }
    }
}

/// Result of clearing local data.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClearDataResponse {
    /// Always `true` on success.
    #[schema(example = true)]
    pub cleared: bool,
}

/// A stored video clip.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VideoUploadResponse {
    /// Session the clip belongs to.
    pub session_id: SessionId,

    /// Clip number within the session.
    #[schema(example = 0)]
    pub index: usize,

    /// Where the clip was stored.
    #[schema(example = "file:///var/lib/convoy/objects/sessions/1736912400000/videos/video_0.mp4")]
    pub url: String,
}

/// Largest accepted video clip.
pub const MAX_VIDEO_BYTES: usize = 512 * 1024 * 1024;

// ============================================================================
// Handlers
// ============================================================================

/// List every locally known session.
#[utoipa::path(
    get,
    path = "/api/sessions",
    tag = "sessions",
    operation_id = "listSessions",
    summary = "List local sessions",
    description = "Returns completed sessions, previously synced sessions and \
        the current session, ordered by id.",
    responses(
        (status = 200, description = "Sessions listed", body = SessionsResponse),
        (status = 500, description = "Local storage failed")
    )
)]
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<SessionsResponse>> {
    let sessions = state.store().lock().await.list_sessions()?;
    Ok(Json(sessions.into()))
}

/// Fetch every session from the shared backend.
#[utoipa::path(
    get,
    path = "/api/sessions/remote",
    tag = "sessions",
    operation_id = "syncRemoteSessions",
    summary = "Fetch and merge remote sessions",
    description = "Reads all sessions from the shared backend, merges them into \
        the local history and returns them ordered by start time. The current \
        session is never overwritten.",
    responses(
        (status = 200, description = "Remote sessions", body = SessionsResponse),
        (status = 502, description = "Remote store unavailable")
    )
)]
pub async fn sync_remote_sessions(
    State(state): State<AppState>,
) -> ApiResult<Json<SessionsResponse>> {
    let sessions = state.channel().fetch_all_sessions().await?;

    let mut store = state.store().lock().await;
    for session in &sessions {
        store.merge_remote_session(session.clone())?;
    }
    drop(store);

    info!(count = sessions.len(), "Merged remote sessions");
    Ok(Json(sessions.into()))
}

/// Download the export document.
#[utoipa::path(
    get,
    path = "/api/export",
    tag = "sessions",
    operation_id = "exportSessions",
    summary = "Export all sessions",
    description = "Returns a text export of every locally known session with \
        its events and samples, for manual sharing. The response carries a \
        `Content-Disposition` file name `safety_validator_export_YYYY-MM-DD.txt`.",
    responses(
        (status = 200, description = "Export document", content_type = "text/plain", body = ExportDocument),
        (status = 500, description = "Local storage failed")
    )
)]
pub async fn export_sessions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let sessions = state.store().lock().await.list_sessions()?;
    let document = ExportDocument::new(sessions);
    let text = document.render().map_err(|err| ApiError::InternalError {
        error_code: "export_failed".to_string(),
        message: "Failed to render the export".to_string(),
        details: Some(err.to_string()),
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", document.file_name()),
            ),
        ],
        text,
    ))
}

/// Store a video clip pulled from the companion unit.
#[utoipa::path(
    put,
    path = "/api/sessions/{id}/videos/{index}",
    tag = "sessions",
    operation_id = "uploadVideo",
    summary = "Upload a session video clip",
    description = "Stores the raw MP4 body at `sessions/{id}/videos/video_{index}.mp4` \
        in object storage. Uploading the same index again replaces the clip. \
        The session must be known on this device.",
    params(
        ("id" = String, Path, description = "Session id"),
        ("index" = usize, Path, description = "Clip number, starting at 0")
    ),
    request_body(content = Vec<u8>, content_type = "video/mp4"),
    responses(
        (status = 201, description = "Clip stored", body = VideoUploadResponse),
        (status = 400, description = "Invalid session id or empty body", body = ErrorResponse),
        (status = 404, description = "Session not known on this device", body = ErrorResponse),
        (status = 502, description = "Object storage failed", body = ErrorResponse)
    )
)]
pub async fn upload_video(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<VideoUploadResponse>)> {
    let session_id = SessionId::parse(&id)?;
    if body.is_empty() {
        return Err(ApiError::BadRequest {
            error_code: "empty_video".to_string(),
            message: "Video body cannot be empty".to_string(),
        });
    }

    let known = state
        .store()
        .lock()
        .await
        .list_sessions()?
        .iter()
        .any(|session| session.id == session_id);
    if !known {
        return Err(ApiError::NotFound {
            error_code: "session_not_found".to_string(),
            message: format!("Session {session_id} is not known on this device"),
        });
    }

    let url = state
        .artifacts()
        .upload_video(&session_id, index, body.to_vec())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(VideoUploadResponse {
            session_id,
            index,
            url,
        }),
    ))
}

/// Erase all local data.
#[utoipa::path(
    delete,
    path = "/api/data",
    tag = "sessions",
    operation_id = "clearData",
    summary = "Clear all local data",
    description = "Leaves any session and irreversibly deletes the current \
        session, the session history and the pending export queue on this \
        device. The shared backend is not touched.",
    responses(
        (status = 200, description = "Local data cleared", body = ClearDataResponse),
        (status = 500, description = "Local storage failed")
    )
)]
pub async fn clear_data(State(state): State<AppState>) -> ApiResult<Json<ClearDataResponse>> {
    state.coordinator().reset().await?;
    Ok(Json(ClearDataResponse { cleared: true }))
}
