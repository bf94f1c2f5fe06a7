//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`config.toml` in the platform config directory,
//!    or the path given to [`Config::load_from`])
//! 3. environment overrides of the form `CONVOY__SECTION__KEY`, for example
//!    `CONVOY__DEVICE__ROLE=validator`
//!
//! ```toml
//! [device]
//! role = "driver"
//! name = "lead-car"
//!
//! [remote]
//! backend = "http"
//! base_url = "https://convoy-default-rtdb.firebaseio.com"
//!
//! [uploads]
//! retry_interval_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::bluetooth::DEFAULT_COMPANION_NAME;
use crate::remote::HttpTimeouts;
use crate::types::Role;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CONVOY";

/// Default interval between two export retry passes.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 300;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("valid url regex"));

/// Errors raised while loading, validating or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The layered sources could not be read or merged.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Target file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// One field has an invalid value.
    #[error("Invalid {field}: {message}")]
    ValidationError {
        /// Dotted field name.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields have invalid values.
    #[error("Configuration has {} errors: {}", .0.len(), join_errors(.0))]
    MultipleValidationErrors(Vec<ConfigError>),

    /// The platform config directory could not be determined.
    #[error("Cannot determine config directory")]
    NoConfigDir,
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A specialized result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Which remote session store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// In-process tree. Nothing leaves the process.
    #[default]
    Memory,
    /// Firebase-style REST database.
    Http,
}

/// Which object storage backend receives exports and videos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ObjectBackend {
    /// A local directory.
    #[default]
    Fs,
    /// HTTP `PUT` to a bucket endpoint.
    Http,
}

/// Which companion hardware transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Simulated companion unit.
    #[default]
    Mock,
    /// BlueZ over `bluer`.
    Ble,
}

/// This device's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct DeviceConfig {
    /// Role this device plays in a convoy.
    pub role: Role,
    /// Human-readable device name, used in logs.
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            role: Role::Driver,
            name: "convoy-device".into(),
        }
    }
}

/// Shared session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct RemoteConfig {
    /// Backend kind.
    pub backend: RemoteBackend,
    /// Database root URL (HTTP backend).
    pub base_url: Option<String>,
    /// Database secret or ID token sent as `auth`.
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    /// Subscription polling interval (HTTP backend).
    pub poll_interval_ms: u64,
    /// Deadline of one HTTP request, for every network backend.
    pub request_timeout_secs: u64,
    /// Deadline for establishing an HTTP connection.
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::Memory,
            base_url: None,
            auth_token: None,
            poll_interval_ms: 1_000,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    /// Request deadlines shared by the database, object storage and
    /// geocoding clients.
    #[must_use]
    pub const fn timeouts(&self) -> HttpTimeouts {
        HttpTimeouts {
            request: Duration::from_secs(self.request_timeout_secs),
            connect: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// Local persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to the platform data directory.
    #[schema(value_type = Option<String>)]
    pub data_dir: Option<PathBuf>,
}

/// Export uploads and their retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct UploadsConfig {
    /// Object storage backend.
    pub backend: ObjectBackend,
    /// Directory for the filesystem backend. Defaults to `<data_dir>/objects`.
    #[schema(value_type = Option<String>)]
    pub objects_dir: Option<PathBuf>,
    /// Bucket endpoint for the HTTP backend.
    pub base_url: Option<String>,
    /// Seconds between two retry passes over the pending queue.
    pub retry_interval_secs: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            backend: ObjectBackend::Fs,
            objects_dir: None,
            base_url: None,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

/// Companion hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport implementation.
    pub kind: TransportKind,
    /// Advertised name of the companion unit.
    pub companion_name: String,
    /// Scan duration.
    pub scan_timeout_secs: u64,
    /// Delay before the mock answers a scan.
    pub mock_discovery_delay_ms: u64,
    /// Connect to the companion at startup (driver only).
    pub auto_connect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Mock,
            companion_name: DEFAULT_COMPANION_NAME.into(),
            scan_timeout_secs: 10,
            mock_discovery_delay_ms: 1_000,
            auto_connect: true,
        }
    }
}

/// Reverse geocoding of event positions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct GeocodingConfig {
    /// Nominatim-compatible endpoint. Events carry no address when unset.
    pub base_url: Option<String>,
}

/// HTTP control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".into(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct Config {
    /// Device identity.
    pub device: DeviceConfig,
    /// Shared session store.
    pub remote: RemoteConfig,
    /// Local persistence.
    pub storage: StorageConfig,
    /// Export uploads.
    pub uploads: UploadsConfig,
    /// Companion hardware.
    pub transport: TransportConfig,
    /// Address lookup for events.
    pub geocoding: GeocodingConfig,
    /// HTTP control API.
    pub server: ServerConfig,
}

impl Config {
    /// Load from the default config path plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path` (which may not exist) plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`]
    /// listing every problem.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.device.name.trim().is_empty() {
            errors.push(invalid("device.name", "cannot be empty"));
        }

        if self.remote.backend == RemoteBackend::Http {
            check_url(&mut errors, "remote.base_url", self.remote.base_url.as_deref());
        }
        if self.remote.poll_interval_ms == 0 {
            errors.push(invalid("remote.poll_interval_ms", "must be greater than zero"));
        }
        if self.remote.request_timeout_secs == 0 {
            errors.push(invalid("remote.request_timeout_secs", "must be greater than zero"));
        }
        if self.remote.connect_timeout_secs == 0 {
            errors.push(invalid("remote.connect_timeout_secs", "must be greater than zero"));
        }

        if self.uploads.backend == ObjectBackend::Http {
            check_url(&mut errors, "uploads.base_url", self.uploads.base_url.as_deref());
        }
        if self.uploads.retry_interval_secs == 0 {
            errors.push(invalid("uploads.retry_interval_secs", "must be greater than zero"));
        }

        if self.transport.companion_name.trim().is_empty() {
            errors.push(invalid("transport.companion_name", "cannot be empty"));
        }
        if self.transport.scan_timeout_secs == 0 {
            errors.push(invalid("transport.scan_timeout_secs", "must be greater than zero"));
        }

        if let Some(url) = self.geocoding.base_url.as_deref() {
            check_url(&mut errors, "geocoding.base_url", Some(url));
        }

        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(invalid(
                "server.bind_address",
                &format!("'{}' is not a socket address", self.server.bind_address),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Resolved data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the platform
    /// default cannot be determined.
    pub fn data_dir(&self) -> crate::storage::StorageResult<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::storage::default_data_dir(),
        }
    }

    /// Default configuration file path (`~/.config/convoy/config.toml` on Linux).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] if no home directory is available.
    pub fn config_path() -> ConfigResult<PathBuf> {
        directories::ProjectDirs::from("", "", "convoy")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn check_url(errors: &mut Vec<ConfigError>, field: &str, url: Option<&str>) {
    match url {
        None => errors.push(invalid(field, "is required for the http backend")),
        Some(url) if !URL_RE.is_match(url) => {
            errors.push(invalid(field, &format!("'{url}' is not an http(s) URL")));
        }
        Some(_) => {}
    }
}
