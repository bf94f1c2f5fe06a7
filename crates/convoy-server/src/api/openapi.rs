//! OpenAPI specification for the convoy device API.
//!
//! The document is served at `/api/openapi.json` and written to disk by the
//! `gen-openapi` binary for client generation in the app shell.

use axum::Json;
use utoipa::OpenApi;

use convoy_core::{
    ActiveSessionAnnouncement, Address, CoordinatorState, DiscoveredDevice, EventKind,
    EventLocation, ExportDocument, ExportOutcome, FlushReport, GeoPosition, HealthResponse,
    LocationSample, PendingExport, Role, Session, SessionId, SessionStatus, ValidationEvent,
};

use super::devices::{ConnectDeviceRequest, DeviceLinkResponse, ScanDevicesResponse};
use super::error::ErrorResponse;
use super::events::{RecordEventRequest, RecordLocationRequest};
use super::session::{
    CurrentSessionResponse, EndSessionResponse, JoinSessionRequest, LeaveSessionResponse,
    SessionStateResponse,
};
use super::sessions::{ClearDataResponse, SessionsResponse, VideoUploadResponse};
use super::uploads::PendingUploadsResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for convoy.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "convoy API",
        version = "0.1.0",
        description = r#"
# convoy API

convoy pairs two devices for driving-safety monitoring.

## Roles

- **Driver**: mounted in the lead vehicle. Starts a session, streams location
  samples and ends the session.
- **Validator**: rides in a following vehicle. Joins the session the driver
  announces and records qualitative validation events.

## Consistency

Every event and sample is written to the shared backend first and committed
locally only when that write succeeded. A `502` response means nothing was
recorded and the call can be retried.

## Exports

Ending a session uploads its export. Failed uploads are queued and retried
every five minutes until they succeed (`/api/uploads`).
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local convoy device agent")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "session", description = "Session lifecycle: start, end, join and leave"),
        (name = "events", description = "Validation events and location samples"),
        (name = "sessions", description = "Session history, export, video clips and local data"),
        (name = "uploads", description = "Pending export uploads"),
        (name = "devices", description = "Companion device scanning and connection")
    ),
    paths(
        super::health::health_check,
        super::session::get_current_session,
        super::session::get_session_state,
        super::session::start_session,
        super::session::end_session,
        super::session::join_session,
        super::session::leave_session,
        super::events::record_event,
        super::events::record_location,
        super::sessions::list_sessions,
        super::sessions::sync_remote_sessions,
        super::sessions::export_sessions,
        super::sessions::upload_video,
        super::sessions::clear_data,
        super::uploads::get_pending_uploads,
        super::uploads::flush_uploads,
        super::devices::scan_devices,
        super::devices::connect_device,
        super::devices::disconnect_device,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Model types
            HealthResponse,
            SessionId,
            Role,
            SessionStatus,
            GeoPosition,
            Address,
            EventLocation,
            EventKind,
            ValidationEvent,
            LocationSample,
            Session,
            ActiveSessionAnnouncement,
            PendingExport,
            ExportDocument,
            CoordinatorState,
            ExportOutcome,
            FlushReport,
            DiscoveredDevice,
            // Session types
            CurrentSessionResponse,
            SessionStateResponse,
            JoinSessionRequest,
            EndSessionResponse,
            LeaveSessionResponse,
            // Event types
            RecordEventRequest,
            RecordLocationRequest,
            // History types
            SessionsResponse,
            ClearDataResponse,
            VideoUploadResponse,
            // Upload types
            PendingUploadsResponse,
            // Device types
            ScanDevicesResponse,
            ConnectDeviceRequest,
            DeviceLinkResponse,
        )
    )
)]
pub struct ApiDoc;
