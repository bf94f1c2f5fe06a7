//! Companion hardware transport.
//!
//! The driver device pairs with an in-car companion unit over Bluetooth
//! Low Energy. [`DeviceTransport`] is the seam:
//!
//! - [`MockTransport`] - always finds the simulated `SecuriteAuto` unit
//! - `BleTransport` - real BlueZ scanning through `bluer` (feature `bluetooth`)
//!
//! The transport is picked once at startup from configuration.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::{TransportConfig, TransportKind};

/// Identifier of the simulated companion unit.
pub const MOCK_DEVICE_ID: &str = "MOCK_DEVICE_001";

/// Name broadcast by the companion unit.
pub const DEFAULT_COMPANION_NAME: &str = "SecuriteAuto";

/// Signal strength reported for the simulated unit.
pub const MOCK_DEVICE_RSSI: i16 = -60;

/// Errors raised by a [`DeviceTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operating system refused access (Bluetooth, location or media).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No Bluetooth adapter is present.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    AdapterNotFound,

    /// The adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// The companion unit was not seen during the scan.
    #[error("Device not found: '{name}'. Ensure the device is powered on and within range.")]
    DeviceNotFound {
        /// Name or identifier that was looked for.
        name: String,
    },

    /// Discovery could not run.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailed(String),

    /// The device was found but the connection failed.
    #[error("Failed to connect to '{id}': {message}")]
    ConnectFailed {
        /// Device identifier.
        id: String,
        /// Failure reason.
        message: String,
    },
}

/// A specialized result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "MOCK_DEVICE_001",
    "name": "SecuriteAuto",
    "rssi_dbm": -60
}))]
pub struct DiscoveredDevice {
    /// Transport-specific identifier (MAC address for BLE).
    #[schema(example = "MOCK_DEVICE_001")]
    pub id: String,

    /// Advertised name, if any.
    #[schema(example = "SecuriteAuto")]
    pub name: Option<String>,

    /// Signal strength in dBm.
    #[schema(example = -60)]
    pub rssi_dbm: Option<i16>,
}

/// Link to the companion hardware.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Short name of the implementation, for logs and the API.
    fn kind(&self) -> &'static str;

    /// Prepare the transport (open the adapter, check power).
    async fn initialize(&self) -> TransportResult<()>;

    /// Discover nearby devices for at most `timeout`.
    async fn scan(&self, timeout: Duration) -> TransportResult<Vec<DiscoveredDevice>>;

    /// Connect to the device with `id`. Returns whether the link is up.
    async fn connect(&self, id: &str) -> TransportResult<bool>;

    /// Drop the current link, if any.
    async fn disconnect(&self) -> TransportResult<()>;

    /// Whether a device is currently connected.
    fn is_connected(&self) -> bool;
}

/// Scan for the companion named `name` and connect to it.
///
/// # Errors
///
/// Returns [`TransportError::DeviceNotFound`] if no device with that name
/// answered within `timeout`, or the transport's own error.
pub async fn connect_companion(
    transport: &dyn DeviceTransport,
    name: &str,
    timeout: Duration,
) -> TransportResult<DiscoveredDevice> {
    let devices = transport.scan(timeout).await?;
    let device = devices
        .into_iter()
        .filter(|d| d.name.as_deref() == Some(name))
        .max_by_key(|d| d.rssi_dbm.unwrap_or(i16::MIN))
        .ok_or_else(|| TransportError::DeviceNotFound {
            name: name.to_string(),
        })?;

    if !transport.connect(&device.id).await? {
        return Err(TransportError::ConnectFailed {
            id: device.id,
            message: "device refused the connection".into(),
        });
    }
    info!(transport = transport.kind(), device_id = %device.id, "Companion device connected");
    Ok(device)
}

// ============================================================================
// Mock transport
// ============================================================================

/// Simulated transport. Every scan finds the `SecuriteAuto` unit.
#[derive(Debug)]
pub struct MockTransport {
    discovery_delay: Duration,
    connected: Mutex<Option<String>>,
}

impl MockTransport {
    /// Create a mock that answers scans after `discovery_delay`.
    #[must_use]
    pub const fn new(discovery_delay: Duration) -> Self {
        Self {
            discovery_delay,
            connected: Mutex::new(None),
        }
    }

    /// The connected device id, if any.
    #[must_use]
    pub fn connected_device(&self) -> Option<String> {
        self.connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_connected(&self, id: Option<String>) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn initialize(&self) -> TransportResult<()> {
        debug!("Bluetooth simulation mode enabled");
        Ok(())
    }

    async fn scan(&self, _timeout: Duration) -> TransportResult<Vec<DiscoveredDevice>> {
        tokio::time::sleep(self.discovery_delay).await;
        Ok(vec![DiscoveredDevice {
            id: MOCK_DEVICE_ID.to_string(),
            name: Some(DEFAULT_COMPANION_NAME.to_string()),
            rssi_dbm: Some(MOCK_DEVICE_RSSI),
        }])
    }

    async fn connect(&self, id: &str) -> TransportResult<bool> {
        self.set_connected(Some(id.to_string()));
        Ok(true)
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.set_connected(None);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected_device().is_some()
    }
}

// ============================================================================
// BlueZ transport
// ============================================================================

#[cfg(feature = "bluetooth")]
pub use ble::BleTransport;

#[cfg(feature = "bluetooth")]
mod ble {
    use std::collections::HashSet;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;
    use bluer::{Adapter, AdapterEvent, Address, Device};
    use futures::{pin_mut, StreamExt};
    use tokio::sync::OnceCell;
    use tracing::{debug, warn};

    use super::{DeviceTransport, DiscoveredDevice, TransportError, TransportResult};

    /// Transport backed by the system BlueZ daemon.
    #[derive(Default)]
    pub struct BleTransport {
        adapter: OnceCell<Adapter>,
        connected: Mutex<Option<Device>>,
    }

    impl BleTransport {
        /// Create a transport. The adapter is opened lazily.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        async fn adapter(&self) -> TransportResult<&Adapter> {
            self.adapter
                .get_or_try_init(|| async {
                    let session = bluer::Session::new().await.map_err(map_error)?;
                    let adapter = session
                        .default_adapter()
                        .await
                        .map_err(|_| TransportError::AdapterNotFound)?;
                    if !adapter.is_powered().await.map_err(map_error)? {
                        return Err(TransportError::AdapterPoweredOff);
                    }
                    debug!(adapter = adapter.name(), "Opened Bluetooth adapter");
                    Ok(adapter)
                })
                .await
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Option<Device>> {
            self.connected.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    fn map_error(err: bluer::Error) -> TransportError {
        match err.kind {
            bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
                TransportError::PermissionDenied(err.message)
            }
            _ => TransportError::ScanFailed(err.to_string()),
        }
    }

    async fn describe(adapter: &Adapter, address: Address) -> Option<DiscoveredDevice> {
        let device = adapter.device(address).ok()?;
        Some(DiscoveredDevice {
            id: address.to_string(),
            name: device.name().await.ok().flatten(),
            rssi_dbm: device.rssi().await.ok().flatten(),
        })
    }

    #[async_trait]
    impl DeviceTransport for BleTransport {
        fn kind(&self) -> &'static str {
            "ble"
        }

        async fn initialize(&self) -> TransportResult<()> {
            self.adapter().await.map(|_| ())
        }

        async fn scan(&self, timeout: Duration) -> TransportResult<Vec<DiscoveredDevice>> {
            let adapter = self.adapter().await?;
            let events = adapter.discover_devices().await.map_err(map_error)?;
            pin_mut!(events);

            let mut found: HashSet<Address> = HashSet::new();
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            found.insert(address);
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }

            let mut devices = Vec::with_capacity(found.len());
            for address in found {
                if let Some(device) = describe(adapter, address).await {
                    devices.push(device);
                }
            }
            debug!(count = devices.len(), "BLE scan finished");
            Ok(devices)
        }

        async fn connect(&self, id: &str) -> TransportResult<bool> {
            let address: Address = id.parse().map_err(|_| TransportError::DeviceNotFound {
                name: id.to_string(),
            })?;
            let device = self.adapter().await?.device(address).map_err(map_error)?;
            device
                .connect()
                .await
                .map_err(|err| TransportError::ConnectFailed {
                    id: id.to_string(),
                    message: err.to_string(),
                })?;
            let connected = device.is_connected().await.map_err(map_error)?;
            if connected {
                *self.lock() = Some(device);
            }
            Ok(connected)
        }

        async fn disconnect(&self) -> TransportResult<()> {
            let device = self.lock().take();
            if let Some(device) = device {
                if let Err(err) = device.disconnect().await {
                    warn!(device = %device.address(), error = %err, "BLE disconnect failed");
                }
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.lock().is_some()
        }
    }
}

/// Build the transport selected in configuration.
///
/// Falls back to the mock when BLE is requested in a build without the
/// `bluetooth` feature.
#[must_use]
pub fn transport_for(config: &TransportConfig) -> Arc<dyn DeviceTransport> {
    let mock_delay = Duration::from_millis(config.mock_discovery_delay_ms);
    if config.kind == TransportKind::Ble {
        #[cfg(feature = "bluetooth")]
        return Arc::new(BleTransport::new());
        #[cfg(not(feature = "bluetooth"))]
        warn!("BLE transport requested but the bluetooth feature is disabled, using mock");
    }
    Arc::new(MockTransport::new(mock_delay))
}
