//! Shared session data model.
//!
//! These types are persisted locally, written to the remote session store
//! and returned by the server API, so they all serialize in camelCase to
//! match the remote document layout (`sessionId`, `locationData`, ...).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::PreconditionError;
use crate::remote::split_path;

/// Identifier of a monitoring session.
///
/// The decimal string of the creation timestamp in Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = String, example = "1736912400000")]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse caller input into an identifier that addresses exactly one
    /// remote path segment. Surrounding whitespace is trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`PreconditionError::EmptySessionId`] for blank input and
    /// [`PreconditionError::InvalidSessionId`] when the id contains a `/`
    /// or a character the remote store forbids.
    pub fn parse(raw: &str) -> Result<Self, PreconditionError> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(PreconditionError::EmptySessionId);
        }
        match split_path(id) {
            Ok(segments) if segments.len() == 1 && segments[0] == id => Ok(Self(id.to_string())),
            _ => Err(PreconditionError::InvalidSessionId(id.to_string())),
        }
    }

    /// Build an identifier from a millisecond timestamp.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self(millis.to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The creation timestamp encoded in the identifier, if it is numeric.
    #[must_use]
    pub fn millis(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Whether the identifier is empty (or only whitespace).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which device created (or follows) a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Lead vehicle device. Originates sessions.
    Driver,
    /// Following vehicle device. Joins sessions and records validation events.
    Validator,
}

impl Role {
    /// Device type tag written to the remote session document.
    #[must_use]
    pub const fn device_type(self) -> &'static str {
        match self {
            Self::Driver => "DEVICE",
            Self::Validator => "VALIDATION",
        }
    }

    /// Parse a remote device type tag.
    #[must_use]
    pub fn from_device_type(tag: &str) -> Option<Self> {
        match tag {
            "DEVICE" => Some(Self::Driver),
            "VALIDATION" => Some(Self::Validator),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Driver => write!(f, "driver"),
            Self::Validator => write!(f, "validator"),
        }
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is running.
    #[default]
    Active,
    /// Session has ended.
    Completed,
}

/// A geographic fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPosition {
    /// Latitude in decimal degrees.
    #[schema(example = 48.8566)]
    pub latitude: f64,

    /// Longitude in decimal degrees.
    #[schema(example = 2.3522)]
    pub longitude: f64,

    /// Horizontal accuracy in meters.
    #[schema(example = 10.0)]
    pub accuracy: f64,
}

impl GeoPosition {
    /// Create a new position.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
        }
    }
}

/// Reverse-geocoded address fields. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
}

impl Address {
    /// Whether no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.street.is_none()
            && self.city.is_none()
            && self.region.is_none()
            && self.postal_code.is_none()
    }
}

/// Position attached to a validation event, with an optional address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventLocation {
    /// The GPS fix.
    #[serde(flatten)]
    pub position: GeoPosition,

    /// Address fields, when reverse geocoding succeeded.
    #[serde(flatten)]
    pub address: Address,
}

/// A telemetry sample recorded during a session. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    /// Session the sample belongs to.
    pub session_id: SessionId,

    /// When the sample was taken (UTC).
    pub timestamp: DateTime<Utc>,

    /// Position fix.
    pub location: GeoPosition,

    /// Instantaneous speed in m/s.
    pub speed: f64,

    /// Altitude in meters.
    pub altitude: f64,

    /// Whether the companion hardware was connected when sampled.
    pub device_connected: bool,
}

/// The three qualitative event categories a validator can log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// The detector raised an alert with no real hazard.
    FauxPositif,
    /// A serious hazard went undetected.
    DangerNonDetecte,
    /// A moderate hazard went undetected.
    MoyenNonDetecte,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::FauxPositif => "FAUX_POSITIF",
            Self::DangerNonDetecte => "DANGER_NON_DETECTE",
            Self::MoyenNonDetecte => "MOYEN_NON_DETECTE",
        };
        f.write_str(tag)
    }
}

/// A human-entered annotation of how detection performed. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationEvent {
    /// Event identifier, derived from the creation timestamp.
    #[schema(example = "1736912405123")]
    pub event_id: String,

    /// Session the event belongs to.
    pub session_id: SessionId,

    /// Event category.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// When the event was recorded (UTC).
    pub timestamp: DateTime<Utc>,

    /// Where the event was recorded.
    pub location: EventLocation,

    /// Observed speed in m/s.
    pub speed: f64,

    /// Free-text note.
    #[serde(default)]
    pub notes: String,
}

/// One timed monitoring period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,

    /// When the session started (UTC).
    pub start_time: DateTime<Utc>,

    /// When the session ended, once it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Role of the device that holds this copy.
    pub role: Role,

    /// Lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,

    /// Telemetry samples in creation order.
    #[serde(default)]
    pub location_data: Vec<LocationSample>,

    /// Validation events in creation order.
    #[serde(default)]
    pub events: Vec<ValidationEvent>,
}

impl Session {
    /// A fresh, active session with no samples or events.
    #[must_use]
    pub const fn new(id: SessionId, role: Role, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            start_time,
            end_time: None,
            role,
            status: SessionStatus::Active,
            location_data: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Whether the session is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Payload of the well-known `activeSession` slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionAnnouncement {
    /// Announced session.
    pub session_id: SessionId,

    /// Its lifecycle status at announcement time.
    pub status: SessionStatus,

    /// When it started (UTC).
    pub start_time: DateTime<Utc>,
}

impl From<&Session> for ActiveSessionAnnouncement {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            start_time: session.start_time,
        }
    }
}

/// A session snapshot waiting for its export upload to be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingExport {
    /// Queue entry identifier.
    pub id: Uuid,

    /// When the snapshot was queued.
    pub queued_at: DateTime<Utc>,

    /// The session snapshot to export.
    pub session: Session,
}

impl PendingExport {
    /// Queue a snapshot of `session` now.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            id: Uuid::new_v4(),
            queued_at: Utc::now(),
            session,
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Role this device plays.
    pub role: Role,
}

/// Current Unix time in milliseconds, clamped to zero before the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Next strictly increasing timestamp-derived identifier.
///
/// Uses the wall clock unless it has not advanced past `last`, in which
/// case `last + 1` is returned.
#[must_use]
pub fn next_timestamp_id(last: u64) -> u64 {
    now_millis().max(last.saturating_add(1))
}
