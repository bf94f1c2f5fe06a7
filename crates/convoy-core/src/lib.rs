//! # convoy-core
//!
//! Core session coordination for convoy, a two-device driving-safety
//! monitoring system.
//!
//! A *driver* device runs a monitoring session and streams telemetry. A
//! *validator* device in a following vehicle joins that session and
//! records qualitative validation events. Both write into a shared
//! path-addressed remote store.
//!
//! ## Architecture
//!
//! - [`types`] - Session data model shared by storage, remote and API
//! - [`storage`] - Durable local key-value persistence of sessions
//! - [`remote`] - Remote store seam, backends and the typed session channel
//! - [`coordinator`] - Session lifecycle state machine for both roles
//! - [`recorder`] - Validation events and location samples
//! - [`uploads`] - Export uploads with a persisted retry queue
//! - [`artifacts`] - Object storage for exports and video clips
//! - [`export`] - Shareable export document
//! - [`geocode`] - Reverse geocoding of event positions
//! - [`bluetooth`] - Companion hardware transport
//! - [`config`] - Layered configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod artifacts;
pub mod bluetooth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod geocode;
pub mod recorder;
pub mod remote;
pub mod storage;
pub mod types;
pub mod uploads;

// Re-export primary types for convenience
pub use artifacts::{ArtifactStore, FsObjectStore, HttpObjectStore, ObjectStore, VIDEO_MP4};
pub use bluetooth::{
    connect_companion, transport_for, DeviceTransport, DiscoveredDevice, MockTransport,
    TransportError, TransportResult,
};
pub use config::{Config, ConfigError, ConfigResult};
pub use coordinator::{CoordinatorState, EndedSession, SessionCoordinator};
pub use error::{ConvoyError, PreconditionError, Result};
pub use export::ExportDocument;
pub use geocode::{Geocoder, NominatimGeocoder};
pub use recorder::EventRecorder;
pub use remote::{
    HttpRemoteStore, HttpTimeouts, MemoryRemoteStore, RemoteError, RemoteResult, RemoteSessionChannel,
    RemoteStore, Subscription,
};
pub use storage::{default_data_dir, SessionStore, SharedStore, StorageError, StorageResult};
pub use types::{
    ActiveSessionAnnouncement, Address, EventKind, EventLocation, GeoPosition, HealthResponse,
    LocationSample, PendingExport, Role, Session, SessionId, SessionStatus, ValidationEvent,
};
pub use uploads::{DeferredUploadQueue, ExportOutcome, ExportUploader, FlushReport};
