//! Session lifecycle API endpoints.
//!
//! A driver starts and ends sessions. A validator joins the announced
//! session automatically, or explicitly by id, and follows it until the
//! driver completes it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use convoy_core::{CoordinatorState, ExportOutcome, Role, Session, SessionId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::AppState;

/// Creates the session router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_current_session))
        .route("/state", get(get_session_state))
        .route("/start", post(start_session))
        .route("/end", post(end_session))
        .route("/join", post(join_session))
        .route("/leave", post(leave_session))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// The session currently running on this device.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrentSessionResponse {
    /// Current session, `null` when none.
    pub session: Option<Session>,
}

/// Coordinator state of this device.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "role": "validator",
    "coordinator": {"state": "joined", "sessionId": "1736912400000"},
    "mirrored_session": null
}))]
pub struct SessionStateResponse {
    /// Role this device plays.
    pub role: Role,

    /// Lifecycle state.
    pub coordinator: CoordinatorState,

    /// Latest remote copy of the joined session (validator only).
    pub mirrored_session: Option<Session>,
}

/// Request body for joining a session.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({"session_id": "1736912400000"}))]
pub struct JoinSessionRequest {
    /// Identifier of the session to follow.
    #[schema(example = "1736912400000", min_length = 1)]
    pub session_id: String,
}

/// Result of ending the current session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "ended": true,
    "session": null,
    "export": "uploaded"
}))]
pub struct EndSessionResponse {
    /// Whether a session was running.
    #[schema(example = true)]
    pub ended: bool,

    /// Final local copy of the ended session.
    pub session: Option<Session>,

    /// Upload outcome of its export.
    pub export: Option<ExportOutcome>,
}

/// Result of leaving the followed session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LeaveSessionResponse {
    /// Whether a session was followed.
    #[schema(example = true)]
    pub left: bool,

    /// Local copy of the left session.
    pub session: Option<Session>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the current local session.
#[utoipa::path(
    get,
    path = "/api/session",
    tag = "session",
    operation_id = "getCurrentSession",
    summary = "Get the current session",
    description = "Returns the session currently running or followed on this \
        device, with every event and location sample recorded so far.",
    responses(
        (status = 200, description = "Current session", body = CurrentSessionResponse),
        (status = 500, description = "Local storage failed")
    )
)]
pub async fn get_current_session(
    State(state): State<AppState>,
) -> ApiResult<Json<CurrentSessionResponse>> {
    let session = state.store().lock().await.current_session()?;
    Ok(Json(CurrentSessionResponse { session }))
}

/// Get the coordinator state.
#[utoipa::path(
    get,
    path = "/api/session/state",
    tag = "session",
    operation_id = "getSessionState",
    summary = "Get the coordinator state",
    description = "Returns whether this device is idle, running a session \
        (driver) or following one (validator), plus the mirrored remote copy.",
    responses(
        (status = 200, description = "Coordinator state", body = SessionStateResponse)
    )
)]
pub async fn get_session_state(State(state): State<AppState>) -> Json<SessionStateResponse> {
    Json(state_response(&state))
}

/// Start a driver session.
#[utoipa::path(
    post,
    path = "/api/session/start",
    tag = "session",
    operation_id = "startSession",
    summary = "Start a session",
    description = "Creates a session, publishes it and announces it so that \
        validators can join. Driver only. The companion device must be connected.",
    responses(
        (status = 201, description = "Session started", body = Session),
        (status = 403, description = "Device is not a driver"),
        (status = 409, description = "A session is already active or the companion is not connected"),
        (status = 502, description = "Remote store unavailable, nothing was committed")
    )
)]
pub async fn start_session(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.coordinator().start_session().await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// End the current session.
#[utoipa::path(
    post,
    path = "/api/session/end",
    tag = "session",
    operation_id = "endSession",
    summary = "End the current session",
    description = "Ends the local session and exports it. A driver also marks \
        it completed remotely. Ending when no session is running is a no-op.",
    responses(
        (status = 200, description = "Session ended (or nothing to end)", body = EndSessionResponse),
        (status = 502, description = "Remote update failed after the local end")
    )
)]
pub async fn end_session(State(state): State<AppState>) -> ApiResult<Json<EndSessionResponse>> {
    let ended = state.coordinator().end_session().await?;
    Ok(Json(match ended {
        Some(ended) => EndSessionResponse {
            ended: true,
            session: Some(ended.session),
            export: ended.export,
        },
        None => EndSessionResponse {
            ended: false,
            session: None,
            export: None,
        },
    }))
}

/// Join a session by id.
#[utoipa::path(
    post,
    path = "/api/session/join",
    tag = "session",
    operation_id = "joinSession",
    summary = "Join a session",
    description = "Follows the given session, replacing any session followed \
        before. Validator only.",
    request_body = JoinSessionRequest,
    responses(
        (status = 200, description = "Session joined", body = SessionStateResponse),
        (status = 400, description = "Empty session id"),
        (status = 403, description = "Device is not a validator"),
        (status = 502, description = "Remote store unavailable")
    )
)]
pub async fn join_session(
    State(state): State<AppState>,
    Json(request): Json<JoinSessionRequest>,
) -> ApiResult<Json<SessionStateResponse>> {
    state
        .coordinator()
        .join(SessionId::new(request.session_id.trim()))
        .await?;
    Ok(Json(state_response(&state)))
}

/// Stop following the joined session.
#[utoipa::path(
    post,
    path = "/api/session/leave",
    tag = "session",
    operation_id = "leaveSession",
    summary = "Leave the followed session",
    description = "Stops following the joined session and ends its local copy \
        without exporting it. Validator only.",
    responses(
        (status = 200, description = "Session left (or nothing to leave)", body = LeaveSessionResponse),
        (status = 403, description = "Device is not a validator")
    )
)]
pub async fn leave_session(
    State(state): State<AppState>,
) -> ApiResult<Json<LeaveSessionResponse>> {
    let session = state.coordinator().leave().await?;
    Ok(Json(LeaveSessionResponse {
        left: session.is_some(),
        session,
    }))
}

// ============================================================================
// Helpers
// ============================================================================

fn state_response(state: &AppState) -> SessionStateResponse {
    let coordinator = state.coordinator();
    let mirrored_session = coordinator.mirrored_session().borrow().clone();
    SessionStateResponse {
        role: coordinator.role(),
        coordinator: coordinator.state(),
        mirrored_session,
    }
}
