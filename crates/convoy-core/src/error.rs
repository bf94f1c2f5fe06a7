//! Unified error types for the convoy core library.
//!
//! Each module owns a specific error type ([`StorageError`],
//! [`RemoteError`], [`TransportError`], [`ConfigError`]). Guards that
//! refuse an operation before any write happens raise a
//! [`PreconditionError`]. [`ConvoyError`] wraps all of them so callers at
//! the edges (the server, the binaries) deal with a single type.
//!
//! None of these errors is fatal: every one of them is reported to the
//! user and the device stays usable.
//!
//! # Example
//!
//! ```rust
//! use convoy_core::error::{ConvoyError, PreconditionError, Result};
//!
//! fn require_fix(fix: Option<f64>) -> Result<f64> {
//!     fix.ok_or(ConvoyError::Precondition(PreconditionError::NoLocationFix))
//! }
//!
//! assert!(require_fix(None).unwrap_err().is_precondition_error());
//! ```

use thiserror::Error;

use crate::bluetooth::TransportError;
use crate::config::ConfigError;
use crate::remote::RemoteError;
use crate::storage::StorageError;
use crate::types::{Role, SessionId};

/// An action was refused because the device is not in a state to perform it.
///
/// Raised before any local or remote write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    /// No session is current on this device.
    #[error("No active session. Start or join a session first.")]
    NoActiveSession,

    /// The caller named a session that is not the current one.
    #[error("Session '{requested}' is not the current session on this device (current: '{current}')")]
    SessionMismatch {
        /// Session the caller asked for.
        requested: SessionId,
        /// Session that is actually current.
        current: SessionId,
    },

    /// A session identifier was required but empty.
    #[error("Session id cannot be empty")]
    EmptySessionId,

    /// A session identifier would address more than one remote path segment.
    #[error("Session id '{0}' must be a single path segment without / . # $ [ ]")]
    InvalidSessionId(String),

    /// No GPS fix is available yet.
    #[error("GPS position unavailable. Wait for a location fix and try again.")]
    NoLocationFix,

    /// A session is already running on this device.
    #[error("Session '{0}' is already active. End it before starting another.")]
    SessionAlreadyActive(SessionId),

    /// The operation belongs to the other device role.
    #[error("This operation requires the {expected} role but this device is a {actual}")]
    WrongRole {
        /// Role the operation requires.
        expected: Role,
        /// Role this device was configured with.
        actual: Role,
    },

    /// The companion hardware must be connected first.
    #[error("Companion device is not connected. Connect it before starting a session.")]
    DeviceNotConnected,
}

/// The unified error type for all convoy operations.
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Missing session, missing location fix, wrong state.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// Local persistence failed.
    #[error(transparent)]
    Storage(StorageError),

    /// Remote channel publish, subscribe or upload failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Companion hardware or permission failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A specialized [`Result`] type for convoy operations.
pub type Result<T> = std::result::Result<T, ConvoyError>;

impl ConvoyError {
    /// Returns `true` if the action was refused by a guard.
    #[inline]
    #[must_use]
    pub const fn is_precondition_error(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// Returns `true` if local persistence failed.
    #[inline]
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns `true` if the remote backend failed.
    #[inline]
    #[must_use]
    pub const fn is_remote_error(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Returns `true` if a hardware, location or media permission was denied.
    #[inline]
    #[must_use]
    pub const fn is_permission_error(&self) -> bool {
        matches!(self, Self::Transport(TransportError::PermissionDenied(_)))
    }

    /// Returns `true` if retrying later may succeed without user action.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Remote(err) => err.is_transient(),
            Self::Transport(TransportError::ScanFailed(_) | TransportError::DeviceNotFound { .. }) => {
                true
            }
            _ => false,
        }
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::Precondition(
                PreconditionError::EmptySessionId | PreconditionError::InvalidSessionId(_),
            ) => 400,
            Self::Precondition(PreconditionError::WrongRole { .. }) => 403,
            Self::Precondition(_) => 409,
            Self::Storage(_) => 500,
            Self::Remote(_) => 502,
            Self::Transport(TransportError::PermissionDenied(_)) => 403,
            Self::Transport(TransportError::DeviceNotFound { .. }) => 404,
            Self::Transport(_) => 503,
            Self::Config(_) => 422,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Precondition(err) => match err {
                PreconditionError::NoActiveSession => "NO_ACTIVE_SESSION",
                PreconditionError::SessionMismatch { .. } => "SESSION_MISMATCH",
                PreconditionError::EmptySessionId => "EMPTY_SESSION_ID",
                PreconditionError::InvalidSessionId(_) => "INVALID_SESSION_ID",
                PreconditionError::NoLocationFix => "NO_LOCATION_FIX",
                PreconditionError::SessionAlreadyActive(_) => "SESSION_ALREADY_ACTIVE",
                PreconditionError::WrongRole { .. } => "WRONG_ROLE",
                PreconditionError::DeviceNotConnected => "DEVICE_NOT_CONNECTED",
            },
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Remote(_) => "REMOTE_ERROR",
            Self::Transport(err) => match err {
                TransportError::PermissionDenied(_) => "PERMISSION_DENIED",
                TransportError::AdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
                TransportError::AdapterPoweredOff => "BLUETOOTH_ADAPTER_POWERED_OFF",
                TransportError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
                TransportError::ScanFailed(_) => "BLUETOOTH_SCAN_FAILED",
                TransportError::ConnectFailed { .. } => "DEVICE_CONNECT_FAILED",
            },
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<StorageError> for ConvoyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Precondition(precondition) => Self::Precondition(precondition),
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        let err: ConvoyError = PreconditionError::NoLocationFix.into();
        assert!(err.is_precondition_error());
        assert!(!err.is_remote_error());
        assert_eq!(err.http_status_code(), 409);
        assert_eq!(err.error_code(), "NO_LOCATION_FIX");
    }

    #[test]
    fn test_empty_session_id_is_bad_request() {
        let err: ConvoyError = PreconditionError::EmptySessionId.into();
        assert_eq!(err.http_status_code(), 400);
    }

    #[test]
    fn test_invalid_session_id_is_bad_request() {
        let err: ConvoyError = PreconditionError::InvalidSessionId("5/vehicles".into()).into();
        assert_eq!(err.http_status_code(), 400);
        assert_eq!(err.error_code(), "INVALID_SESSION_ID");
    }

    #[test]
    fn test_remote_error_classification() {
        let err: ConvoyError = RemoteError::Unavailable("offline".into()).into();
        assert!(err.is_remote_error());
        assert!(err.is_recoverable());
        assert_eq!(err.http_status_code(), 502);
    }

    #[test]
    fn test_permission_error_classification() {
        let err: ConvoyError = TransportError::PermissionDenied("bluetooth".into()).into();
        assert!(err.is_permission_error());
        assert!(!err.is_recoverable());
        assert_eq!(err.http_status_code(), 403);
        assert_eq!(err.error_code(), "PERMISSION_DENIED");
    }

    #[test]
    fn test_storage_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: ConvoyError = StorageError::from(io).into();
        assert!(err.is_storage_error());
        assert_eq!(err.http_status_code(), 500);
    }

    #[test]
    fn test_store_precondition_is_lifted() {
        let err: ConvoyError = StorageError::from(PreconditionError::NoActiveSession).into();
        assert!(err.is_precondition_error());
        assert!(!err.is_storage_error());
    }

    #[test]
    fn test_error_display_messages() {
        let err: ConvoyError = PreconditionError::SessionAlreadyActive(SessionId::new("17")).into();
        assert!(err.to_string().contains("'17' is already active"));

        let err: ConvoyError = PreconditionError::WrongRole {
            expected: Role::Driver,
            actual: Role::Validator,
        }
        .into();
        assert!(err.to_string().contains("requires the driver role"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ConvoyError>();
        assert_sync::<ConvoyError>();
    }
}
