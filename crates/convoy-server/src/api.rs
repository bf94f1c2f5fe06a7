//! HTTP API routes and handlers.
//!
//! Endpoints are organized by domain:
//! - `health` - Service health checks
//! - `session` - Session lifecycle (start, end, join, leave)
//! - `events` - Validation events and location samples
//! - `sessions` - Session history, export, video clips and local data
//! - `uploads` - Pending export queue
//! - `devices` - Companion device scanning and connection
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod devices;
pub mod error;
pub mod events;
pub mod health;
pub mod openapi;
pub mod session;
pub mod sessions;
pub mod uploads;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                 - Health check
/// /api
/// ├── /session            - Current session, state, start, end, join, leave
/// ├── /events             - Record a validation event
/// ├── /locations          - Record a location sample
/// ├── /sessions           - Local history, /remote for the shared backend,
/// │                         /{id}/videos/{index} for clip uploads
/// ├── /export             - Export document download
/// ├── /data               - Clear all local data
/// ├── /uploads            - Pending exports and manual flush
/// ├── /devices            - Companion scan, connect, disconnect
/// └── /openapi.json       - OpenAPI specification
/// ```
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .nest("/session", session::router())
                .route("/events", post(events::record_event))
                .route("/locations", post(events::record_location))
                .route("/sessions", get(sessions::list_sessions))
                .route("/sessions/remote", get(sessions::sync_remote_sessions))
                .route(
                    "/sessions/{id}/videos/{index}",
                    put(sessions::upload_video)
                        .layer(DefaultBodyLimit::max(sessions::MAX_VIDEO_BYTES)),
                )
                .route("/export", get(sessions::export_sessions))
                .route("/data", delete(sessions::clear_data))
                .nest("/uploads", uploads::router())
                .nest("/devices", devices::router())
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
