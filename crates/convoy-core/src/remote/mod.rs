//! Path-addressed remote document store and the session channel built on it.
//!
//! The shared backend is a realtime JSON tree addressed by slash-separated
//! paths (`sessions/{id}/events`). [`RemoteStore`] is the seam over it:
//!
//! - [`MemoryRemoteStore`] - in-process tree, used by tests and demos
//! - [`HttpRemoteStore`] - REST client for a Firebase-style database
//!
//! [`RemoteSessionChannel`] puts typed session operations on top.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

mod channel;
mod http;
mod memory;

pub use channel::{paths, RemoteSessionChannel};
pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

/// Errors raised by remote backends.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The path contains an empty or forbidden segment.
    #[error("Invalid remote path '{0}'. Segments must be non-empty and must not contain . # $ [ ]")]
    InvalidPath(String),

    /// The backend could not be reached.
    #[error("Remote backend unreachable: {0}")]
    Unavailable(String),

    /// The backend answered with an error status.
    #[error("Remote backend returned HTTP {status} for '{path}'")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Path that was addressed.
        path: String,
    },

    /// A document was present but did not have the expected shape.
    #[error("Malformed remote document at '{path}': {message}")]
    Decode {
        /// Path that was read.
        path: String,
        /// Decoder message.
        message: String,
    },

    /// A value could not be encoded for the backend.
    #[error("Failed to encode remote value: {0}")]
    Encode(String),

    /// Secondary object storage rejected an upload.
    #[error("Upload to '{path}' failed: {message}")]
    Upload {
        /// Object path.
        path: String,
        /// Failure reason.
        message: String,
    },
}

impl RemoteError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Upload { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                path: err.url().map(|u| u.path().to_string()).unwrap_or_default(),
            },
            None if err.is_decode() => Self::Decode {
                path: err.url().map(|u| u.path().to_string()).unwrap_or_default(),
                message: err.to_string(),
            },
            None => Self::Unavailable(err.to_string()),
        }
    }
}

/// Timeouts applied to every HTTP backend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    /// Whole-request deadline, including reading the body.
    pub request: Duration,
    /// TCP and TLS connect deadline.
    pub connect: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            connect: Duration::from_secs(10),
        }
    }
}

impl HttpTimeouts {
    /// A client builder with both deadlines set.
    #[must_use]
    pub fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(self.request)
            .connect_timeout(self.connect)
    }

    /// Build a client with both deadlines set.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Unavailable`] if the TLS backend cannot be
    /// initialized.
    pub fn client(&self) -> RemoteResult<reqwest::Client> {
        Ok(self.client_builder().build()?)
    }
}

/// A specialized result type for remote operations.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Callback invoked with the latest value at a subscribed path.
pub type Listener = Box<dyn Fn(Value) + Send + Sync>;

/// Path-addressed document store.
///
/// Writes to a path replace or merge the JSON value stored there. Readers
/// and listeners see the subtree rooted at their path.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Overwrite the value at `path`. `Value::Null` deletes it.
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()>;

    /// Shallow-merge `fields` into the object at `path`.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> RemoteResult<()>;

    /// Append `value` under a new chronologically sortable child key of
    /// `path` and return that key.
    async fn push(&self, path: &str, value: Value) -> RemoteResult<String>;

    /// Read the value at `path`, `None` if absent.
    async fn get(&self, path: &str) -> RemoteResult<Option<Value>>;

    /// Watch `path`.
    ///
    /// The listener fires with the current value right after registration
    /// if one exists, then after every change at or below `path`. Absent
    /// values never fire. Dropping the returned handle unregisters it.
    fn subscribe(&self, path: &str, listener: Listener) -> RemoteResult<Subscription>;
}

/// Handle for an active subscription.
///
/// The listener stays registered until [`Subscription::cancel`] is called
/// or the handle is dropped.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap the teardown action of a backend listener.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unregister the listener.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^.#$\[\]/]+$").expect("valid segment regex"));

/// Split a slash-separated path into validated segments.
///
/// Leading, trailing and doubled slashes are ignored. The empty path
/// addresses the root.
///
/// # Errors
///
/// Returns [`RemoteError::InvalidPath`] if a segment contains a forbidden
/// character.
pub fn split_path(path: &str) -> RemoteResult<Vec<String>> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if SEGMENT_RE.is_match(segment) {
                Ok(segment.to_string())
            } else {
                Err(RemoteError::InvalidPath(path.to_string()))
            }
        })
        .collect()
}
