//! Typed session operations over a [`RemoteStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{RemoteError, RemoteResult, RemoteStore, Subscription};
use crate::types::{
    ActiveSessionAnnouncement, LocationSample, Role, Session, SessionId, SessionStatus,
    ValidationEvent,
};

/// Remote path layout.
pub mod paths {
    use crate::types::SessionId;

    /// Parent of every session document.
    pub const SESSIONS: &str = "sessions";

    /// Single slot a driver uses to announce a new session.
    pub const ACTIVE_SESSION: &str = "activeSession";

    /// Full session document.
    #[must_use]
    pub fn session(id: &SessionId) -> String {
        format!("{SESSIONS}/{id}")
    }

    /// Append-only event collection.
    #[must_use]
    pub fn events(id: &SessionId) -> String {
        format!("{SESSIONS}/{id}/events")
    }

    /// Append-only location sample collection.
    #[must_use]
    pub fn location_data(id: &SessionId) -> String {
        format!("{SESSIONS}/{id}/locationData")
    }

    /// Vehicles attached to a session (the validator join marker lives here).
    #[must_use]
    pub fn vehicles(id: &SessionId) -> String {
        format!("{SESSIONS}/{id}/vehicles")
    }
}

/// The remote shape of a session: collections are keyed maps written by
/// `push`, lifecycle fields sit at the top level.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDocument {
    #[serde(default)]
    id: Option<SessionId>,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default, rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    status: SessionStatus,
    #[serde(default)]
    events: BTreeMap<String, ValidationEvent>,
    #[serde(default)]
    location_data: BTreeMap<String, LocationSample>,
}

impl SessionDocument {
    fn into_session(self, fallback_id: &SessionId) -> Session {
        let role = self
            .role
            .or_else(|| self.device_type.as_deref().and_then(Role::from_device_type))
            .unwrap_or(Role::Driver);

        let mut events: Vec<(String, ValidationEvent)> = self.events.into_iter().collect();
        events.sort_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)));

        let mut samples: Vec<(String, LocationSample)> = self.location_data.into_iter().collect();
        samples.sort_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)));

        Session {
            id: self.id.unwrap_or_else(|| fallback_id.clone()),
            start_time: self.start_time,
            end_time: self.end_time,
            role,
            status: self.status,
            location_data: samples.into_iter().map(|(_, s)| s).collect(),
            events: events.into_iter().map(|(_, e)| e).collect(),
        }
    }
}

/// Publishes and observes session state on the shared backend.
///
/// Cheap to clone. Every clone talks to the same store.
#[derive(Clone)]
pub struct RemoteSessionChannel {
    store: Arc<dyn RemoteStore>,
}

impl RemoteSessionChannel {
    /// Wrap a remote store.
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Write or overwrite the full remote document of `session`.
    ///
    /// Collections are keyed by entry id so a later `push` from the other
    /// device sorts alongside them.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn publish_session(&self, session: &Session) -> RemoteResult<()> {
        let mut document = to_value(session)?;
        if let Some(object) = document.as_object_mut() {
            object.insert("type".into(), json!(session.role.device_type()));
            object.insert(
                "events".into(),
                keyed(session.events.iter().map(|e| (e.event_id.clone(), e)))?,
            );
            object.insert(
                "locationData".into(),
                keyed(session.location_data.iter().map(|s| {
                    (format!("{:013}", s.timestamp.timestamp_millis()), s)
                }))?,
            );
        }
        debug!(session_id = %session.id, "Publishing session document");
        self.store.set(&paths::session(&session.id), document).await
    }

    /// Update only the lifecycle fields of a session.
    ///
    /// Never touches the event or location collections, so it cannot
    /// clobber entries appended by the other device.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        end_time: Option<DateTime<Utc>>,
    ) -> RemoteResult<()> {
        let mut fields = Map::new();
        fields.insert("status".into(), to_value(&status)?);
        if let Some(end_time) = end_time {
            fields.insert("endTime".into(), to_value(&end_time)?);
        }
        debug!(session_id = %id, ?status, "Updating remote session status");
        self.store.update(&paths::session(id), fields).await
    }

    /// Append one event without rewriting the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn append_event(&self, id: &SessionId, event: &ValidationEvent) -> RemoteResult<String> {
        debug!(session_id = %id, event_id = %event.event_id, kind = %event.kind, "Appending remote event");
        self.store.push(&paths::events(id), to_value(event)?).await
    }

    /// Append one location sample without rewriting the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn append_location_sample(
        &self,
        id: &SessionId,
        sample: &LocationSample,
    ) -> RemoteResult<String> {
        self.store.push(&paths::location_data(id), to_value(sample)?).await
    }

    /// Watch a session document.
    ///
    /// `on_change` receives the latest full session each time it changes.
    /// Documents that cannot be decoded are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be registered.
    pub fn observe_session(
        &self,
        id: &SessionId,
        on_change: impl Fn(Session) + Send + Sync + 'static,
    ) -> RemoteResult<Subscription> {
        let session_id = id.clone();
        self.store.subscribe(
            &paths::session(id),
            Box::new(move |value| match decode_session(&session_id, value) {
                Ok(session) => on_change(session),
                Err(err) => warn!(session_id = %session_id, error = %err, "Skipping undecodable session document"),
            }),
        )
    }

    /// Broadcast `session` on the well-known active-session slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn announce_active_session(&self, session: &Session) -> RemoteResult<()> {
        let announcement = ActiveSessionAnnouncement::from(session);
        debug!(session_id = %session.id, status = ?session.status, "Announcing session");
        self.store.set(paths::ACTIVE_SESSION, to_value(&announcement)?).await
    }

    /// Watch the active-session slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be registered.
    pub fn observe_active_session(
        &self,
        on_change: impl Fn(ActiveSessionAnnouncement) + Send + Sync + 'static,
    ) -> RemoteResult<Subscription> {
        self.store.subscribe(
            paths::ACTIVE_SESSION,
            Box::new(move |value| match decode::<ActiveSessionAnnouncement>(paths::ACTIVE_SESSION, value) {
                Ok(announcement) => on_change(announcement),
                Err(err) => warn!(error = %err, "Skipping undecodable session announcement"),
            }),
        )
    }

    /// Mark that a validator follows `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn mark_follower_joined(&self, id: &SessionId) -> RemoteResult<()> {
        let mut fields = Map::new();
        fields.insert(
            "follower".into(),
            json!({
                "type": Role::Validator.device_type(),
                "connected": true,
                "timestamp": Utc::now(),
            }),
        );
        self.store.update(&paths::vehicles(id), fields).await
    }

    /// Read one session document.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the document is malformed.
    pub async fn fetch_session(&self, id: &SessionId) -> RemoteResult<Option<Session>> {
        self.store
            .get(&paths::session(id))
            .await?
            .map(|value| decode_session(id, value))
            .transpose()
    }

    /// Read every session document. Malformed documents are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn fetch_all_sessions(&self) -> RemoteResult<Vec<Session>> {
        let Some(Value::Object(documents)) = self.store.get(paths::SESSIONS).await? else {
            return Ok(Vec::new());
        };

        let mut sessions: Vec<Session> = documents
            .into_iter()
            .filter_map(|(key, value)| {
                let id = SessionId::new(key);
                decode_session(&id, value)
                    .map_err(|err| warn!(session_id = %id, error = %err, "Skipping malformed session"))
                    .ok()
            })
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(sessions)
    }
}

fn decode_session(id: &SessionId, value: Value) -> RemoteResult<Session> {
    decode::<SessionDocument>(&paths::session(id), value).map(|doc| doc.into_session(id))
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> RemoteResult<T> {
    serde_json::from_value(value).map_err(|err| RemoteError::Decode {
        path: path.to_string(),
        message: err.to_string(),
    })
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> RemoteResult<Value> {
    serde_json::to_value(value).map_err(|err| RemoteError::Encode(err.to_string()))
}

fn keyed<'a, T: Serialize + 'a>(entries: impl Iterator<Item = (String, &'a T)>) -> RemoteResult<Value> {
    let mut map = Map::new();
    for (key, entry) in entries {
        map.insert(key, to_value(entry)?);
    }
    Ok(Value::Object(map))
}
