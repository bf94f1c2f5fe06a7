//! Validation event and telemetry endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use convoy_core::{EventKind, GeoPosition, LocationSample, ValidationEvent};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

/// Request body for recording a validation event.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "session_id": "1736912400000",
    "kind": "DANGER_NON_DETECTE",
    "location": {"latitude": 48.8566, "longitude": 2.3522, "accuracy": 10.0},
    "speed": 12.0,
    "notes": "pedestrian crossing, no alert"
}))]
pub struct RecordEventRequest {
    /// Session the event belongs to. Must be the current session.
    #[schema(example = "1736912400000")]
    pub session_id: String,

    /// Qualitative category.
    pub kind: EventKind,

    /// Current GPS fix. `null` when no fix is available.
    pub location: Option<GeoPosition>,

    /// Observed speed in m/s.
    #[serde(default)]
    #[schema(example = 12.0)]
    pub speed: f64,

    /// Free-text note.
    #[serde(default)]
    pub notes: String,
}

/// Request body for recording a location sample.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "session_id": "1736912400000",
    "location": {"latitude": 48.8566, "longitude": 2.3522, "accuracy": 5.0},
    "speed": 13.9,
    "altitude": 35.0
}))]
pub struct RecordLocationRequest {
    /// Session the sample belongs to. Must be the current session.
    pub session_id: String,

    /// Current GPS fix. `null` when no fix is available.
    pub location: Option<GeoPosition>,

    /// Speed in m/s.
    #[serde(default)]
    pub speed: f64,

    /// Altitude in meters.
    #[serde(default)]
    pub altitude: f64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Record a validation event.
#[utoipa::path(
    post,
    path = "/api/events",
    tag = "events",
    operation_id = "recordEvent",
    summary = "Record a validation event",
    description = "Appends a validation event to the current session, remotely \
        first and then locally. Nothing is written when a precondition fails \
        or the remote append fails.",
    request_body = RecordEventRequest,
    responses(
        (status = 201, description = "Event recorded", body = ValidationEvent),
        (status = 400, description = "Empty session id"),
        (status = 409, description = "No location fix, or the session is not current"),
        (status = 502, description = "Remote store unavailable, nothing was recorded")
    )
)]
pub async fn record_event(
    State(state): State<AppState>,
    Json(request): Json<RecordEventRequest>,
) -> ApiResult<(StatusCode, Json<ValidationEvent>)> {
    let event = state
        .recorder()
        .record(
            &request.session_id,
            request.kind,
            request.location,
            request.speed,
            request.notes,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// Record a location sample.
#[utoipa::path(
    post,
    path = "/api/locations",
    tag = "events",
    operation_id = "recordLocation",
    summary = "Record a location sample",
    description = "Appends a telemetry sample to the current session. The \
        companion link state is filled in by the server.",
    request_body = RecordLocationRequest,
    responses(
        (status = 201, description = "Sample recorded", body = LocationSample),
        (status = 400, description = "Empty session id"),
        (status = 409, description = "No location fix, or the session is not current"),
        (status = 502, description = "Remote store unavailable, nothing was recorded")
    )
)]
pub async fn record_location(
    State(state): State<AppState>,
    Json(request): Json<RecordLocationRequest>,
) -> ApiResult<(StatusCode, Json<LocationSample>)> {
    let sample = state
        .recorder()
        .record_location(
            &request.session_id,
            request.location,
            request.speed,
            request.altitude,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(sample)))
}
