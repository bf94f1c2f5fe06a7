//! API error types and response handling.
//!
//! Every handler returns [`ApiResult`]. Core errors convert into
//! [`ApiError`], which renders a consistent JSON body with the status code
//! of its category.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use convoy_core::{ConvoyError, PreconditionError, TransportError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 403 Forbidden - Wrong device role or a denied permission.
    Forbidden {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Resource does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - The device is not in a state to perform the action.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - Local persistence or configuration failed.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },

    /// 502 Bad Gateway - The remote session store or object storage failed.
    BadGateway {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Whether retrying later may succeed.
        retryable: bool,
    },

    /// 503 Service Unavailable - Companion hardware is unavailable.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "no_location_fix",
    "message": "GPS position unavailable. Wait for a location fix and try again.",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "session_mismatch").
    #[schema(example = "no_active_session")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "No active session. Start or join a session first.")]
    pub message: String,

    /// Optional additional details.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::BadRequest { error_code, message }
            | Self::Forbidden { error_code, message }
            | Self::NotFound { error_code, message }
            | Self::Conflict { error_code, message } => ErrorResponse {
                error: error_code,
                message,
                details: None,
            },

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );
                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(serde_json::Value::String),
                }
            }

            Self::BadGateway {
                error_code,
                message,
                retryable,
            } => {
                tracing::warn!(error_code = %error_code, message = %message, "Remote backend error");
                ErrorResponse {
                    error: error_code,
                    message,
                    details: Some(serde_json::json!({ "retryable": retryable })),
                }
            }

            Self::ServiceUnavailable {
                error_code,
                message,
                details,
            } => ErrorResponse {
                error: error_code,
                message,
                details: details.map(serde_json::Value::String),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::Forbidden { message, .. } => write!(f, "Forbidden: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::BadGateway { message, .. } => write!(f, "Bad Gateway: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from convoy-core errors.
impl From<ConvoyError> for ApiError {
    fn from(err: ConvoyError) -> Self {
        let error_code = err.error_code().to_lowercase();
        let message = err.to_string();

        match &err {
            ConvoyError::Precondition(
                PreconditionError::EmptySessionId | PreconditionError::InvalidSessionId(_),
            ) => {
                Self::BadRequest { error_code, message }
            }
            ConvoyError::Precondition(PreconditionError::WrongRole { .. })
            | ConvoyError::Transport(TransportError::PermissionDenied(_)) => {
                Self::Forbidden { error_code, message }
            }
            ConvoyError::Precondition(_) => Self::Conflict { error_code, message },
            ConvoyError::Transport(TransportError::DeviceNotFound { .. }) => {
                Self::NotFound { error_code, message }
            }
            ConvoyError::Transport(_) => Self::ServiceUnavailable {
                error_code,
                message: "Companion device is unavailable".to_string(),
                details: Some(message),
            },
            ConvoyError::Remote(_) => Self::BadGateway {
                error_code,
                message,
                retryable: err.is_recoverable(),
            },
            ConvoyError::Storage(_) | ConvoyError::Config(_) => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<convoy_core::StorageError> for ApiError {
    fn from(err: convoy_core::StorageError) -> Self {
        Self::from(ConvoyError::from(err))
    }
}

impl From<convoy_core::RemoteError> for ApiError {
    fn from(err: convoy_core::RemoteError) -> Self {
        Self::from(ConvoyError::from(err))
    }
}

impl From<PreconditionError> for ApiError {
    fn from(err: PreconditionError) -> Self {
        Self::from(ConvoyError::from(err))
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        Self::from(ConvoyError::from(err))
    }
}
