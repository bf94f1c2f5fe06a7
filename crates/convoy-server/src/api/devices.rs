//! Companion device endpoints.

use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use convoy_core::{connect_companion, DiscoveredDevice};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Creates the devices router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(scan_devices))
        .route("/connect", post(connect_device))
        .route("/disconnect", post(disconnect_device))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Device scan response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "devices": [
        {"id": "MOCK_DEVICE_001", "name": "SecuriteAuto", "rssi_dbm": -60}
    ],
    "scan_duration_secs": 10,
    "scanned_at_utc": "2025-01-15T03:30:00Z"
}))]
pub struct ScanDevicesResponse {
    /// Discovered devices.
    pub devices: Vec<DiscoveredDevice>,

    /// Scan timeout used.
    #[schema(example = 10)]
    pub scan_duration_secs: u64,

    /// When the scan completed.
    #[schema(example = "2025-01-15T03:30:00Z")]
    pub scanned_at_utc: String,
}

/// Request body for connecting the companion.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ConnectDeviceRequest {
    /// Device to connect. When omitted the configured companion name is
    /// looked up with a scan.
    #[schema(example = "MOCK_DEVICE_001")]
    pub device_id: Option<String>,
}

/// Companion link state.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceLinkResponse {
    /// Whether the companion is connected.
    #[schema(example = true)]
    pub connected: bool,

    /// Connected device id.
    #[schema(example = "MOCK_DEVICE_001")]
    pub device_id: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Scan for companion devices.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "scanDevices",
    summary = "Scan for companion devices",
    description = "Performs a scan with the configured transport and returns \
        every device found.",
    responses(
        (status = 200, description = "Scan completed", body = ScanDevicesResponse),
        (status = 403, description = "Bluetooth permission denied"),
        (status = 503, description = "Bluetooth unavailable")
    )
)]
pub async fn scan_devices(State(state): State<AppState>) -> ApiResult<Json<ScanDevicesResponse>> {
    let timeout_secs = state.config().transport.scan_timeout_secs;
    let transport = state.transport();

    transport.initialize().await?;
    let devices = transport.scan(Duration::from_secs(timeout_secs)).await?;

    Ok(Json(ScanDevicesResponse {
        devices,
        scan_duration_secs: timeout_secs,
        scanned_at_utc: Utc::now().to_rfc3339(),
    }))
}

/// Connect the companion device.
#[utoipa::path(
    post,
    path = "/api/devices/connect",
    tag = "devices",
    operation_id = "connectDevice",
    summary = "Connect the companion device",
    description = "Connects the given device, or scans for the configured \
        companion name and connects the first match.",
    request_body = ConnectDeviceRequest,
    responses(
        (status = 200, description = "Connected", body = DeviceLinkResponse),
        (status = 404, description = "Companion not found"),
        (status = 503, description = "Connection failed")
    )
)]
pub async fn connect_device(
    State(state): State<AppState>,
    Json(request): Json<ConnectDeviceRequest>,
) -> ApiResult<Json<DeviceLinkResponse>> {
    let transport = state.transport();
    transport.initialize().await?;

    let device_id = match request.device_id {
        Some(id) => {
            if !transport.connect(&id).await? {
                return Err(ApiError::ServiceUnavailable {
                    error_code: "device_connect_failed".to_string(),
                    message: format!("Device '{id}' refused the connection"),
                    details: None,
                });
            }
            id
        }
        None => {
            let config = &state.config().transport;
            connect_companion(
                transport.as_ref(),
                &config.companion_name,
                Duration::from_secs(config.scan_timeout_secs),
            )
            .await?
            .id
        }
    };

    info!(device_id = %device_id, "Companion connected via API");
    Ok(Json(DeviceLinkResponse {
        connected: transport.is_connected(),
        device_id: Some(device_id),
    }))
}

/// Disconnect the companion device.
#[utoipa::path(
    post,
    path = "/api/devices/disconnect",
    tag = "devices",
    operation_id = "disconnectDevice",
    summary = "Disconnect the companion device",
    responses(
        (status = 200, description = "Disconnected", body = DeviceLinkResponse)
    )
)]
pub async fn disconnect_device(
    State(state): State<AppState>,
) -> ApiResult<Json<DeviceLinkResponse>> {
    state.transport().disconnect().await?;
    Ok(Json(DeviceLinkResponse {
        connected: false,
        device_id: None,
    }))
}
