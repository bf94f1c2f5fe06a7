//! Appends validation events and location samples to the current session.
//!
//! Every append is written to the remote channel first and committed to
//! the local store only once the remote write succeeded. A remote failure
//! therefore leaves both copies untouched and is reported to the caller.
//!
//! The store lock is never held across a remote call. The current session
//! is checked again before the local commit, so a session that ended while
//! the remote write was in flight is not appended to.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::bluetooth::DeviceTransport;
use crate::error::{PreconditionError, Result};
use crate::geocode::Geocoder;
use crate::remote::RemoteSessionChannel;
use crate::storage::SharedStore;
use crate::types::{
    Address, EventKind, EventLocation, GeoPosition, LocationSample, SessionId, ValidationEvent,
};

/// Records events and telemetry for the current session.
#[derive(Clone)]
pub struct EventRecorder {
    store: SharedStore,
    channel: RemoteSessionChannel,
    geocoder: Option<Arc<dyn Geocoder>>,
    transport: Option<Arc<dyn DeviceTransport>>,
}

impl EventRecorder {
    /// Create a recorder over the shared store and channel.
    pub fn new(store: SharedStore, channel: RemoteSessionChannel) -> Self {
        Self {
            store,
            channel,
            geocoder: None,
            transport: None,
        }
    }

    /// Enrich event positions with reverse-geocoded addresses.
    #[must_use]
    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Report the companion link state in location samples.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn DeviceTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Record a validation event.
    ///
    /// # Errors
    ///
    /// - [`PreconditionError::EmptySessionId`] if `session_id` is blank
    /// - [`PreconditionError::InvalidSessionId`] if it spans several path
    ///   segments
    /// - [`PreconditionError::NoLocationFix`] if `location` is `None`
    /// - [`PreconditionError::NoActiveSession`] or
    ///   [`PreconditionError::SessionMismatch`] if `session_id` is not current
    /// - a remote or storage error if a write fails
    ///
    /// Nothing is written when an error is returned before the remote append.
    pub async fn record(
        &self,
        session_id: &str,
        kind: EventKind,
        location: Option<GeoPosition>,
        speed: f64,
        notes: impl Into<String>,
    ) -> Result<ValidationEvent> {
        let session_id = SessionId::parse(session_id)?;
        let position = location.ok_or(PreconditionError::NoLocationFix)?;
        self.store.lock().await.require_current(&session_id)?;

        let address = self.reverse_geocode(&position).await;

        let event_id = {
            let mut store = self.store.lock().await;
            store.require_current(&session_id)?;
            store.next_timestamp_id().to_string()
        };
        let event = ValidationEvent {
            event_id,
            session_id: session_id.clone(),
            kind,
            timestamp: Utc::now(),
            location: EventLocation { position, address },
            speed,
            notes: notes.into(),
        };

        self.channel.append_event(&session_id, &event).await?;

        let mut store = self.store.lock().await;
        store.require_current(&session_id)?;
        store.append_event(event.clone())?;
        drop(store);

        info!(session_id = %session_id, event_id = %event.event_id, kind = %kind, "Validation event recorded");
        Ok(event)
    }

    /// Record a telemetry sample.
    ///
    /// # Errors
    ///
    /// Same preconditions and ordering as [`EventRecorder::record`].
    pub async fn record_location(
        &self,
        session_id: &str,
        location: Option<GeoPosition>,
        speed: f64,
        altitude: f64,
    ) -> Result<LocationSample> {
        let session_id = SessionId::parse(session_id)?;
        let position = location.ok_or(PreconditionError::NoLocationFix)?;

        self.store.lock().await.require_current(&session_id)?;
        let sample = LocationSample {
            session_id: session_id.clone(),
            timestamp: Utc::now(),
            location: position,
            speed,
            altitude,
            device_connected: self.transport.as_ref().is_some_and(|t| t.is_connected()),
        };

        self.channel.append_location_sample(&session_id, &sample).await?;

        let mut store = self.store.lock().await;
        store.require_current(&session_id)?;
        store.append_location_sample(sample.clone())?;
        drop(store);

        debug!(session_id = %session_id, speed, "Location sample recorded");
        Ok(sample)
    }

    async fn reverse_geocode(&self, position: &GeoPosition) -> Address {
        let Some(geocoder) = &self.geocoder else {
            return Address::default();
        };
        match geocoder.reverse(position).await {
            Ok(address) => address.unwrap_or_default(),
            Err(err) => {
                debug!(error = %err, "Reverse geocoding failed, recording without address");
                Address::default()
            }
        }
    }
}
