//! Local durable session state.
//!
//! Each conceptual key is one pretty-printed JSON file in the data
//! directory:
//!
//! - `current_session.json` - the session currently running on this device
//! - `sessions.json` - every finished or previously synced session, by id
//! - `pending_exports.json` - snapshots waiting for an export retry
//!
//! Writes go through a temporary file and a rename. Failures surface as
//! [`StorageError`] and are never retried here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::PreconditionError;
use crate::types::{
    next_timestamp_id, LocationSample, PendingExport, Role, Session, SessionId, SessionStatus,
    ValidationEvent,
};

const CURRENT_SESSION_FILE: &str = "current_session.json";
const SESSIONS_FILE: &str = "sessions.json";
const PENDING_EXPORTS_FILE: &str = "pending_exports.json";

/// Errors raised by [`SessionStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing a key file failed.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A key file exists but does not contain valid JSON for its type.
    #[error("Corrupt storage file {}: {source}", path.display())]
    Corrupt {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser error.
        source: serde_json::Error,
    },

    /// A value could not be serialized.
    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        /// What was being written.
        what: &'static str,
        /// Serializer error.
        source: serde_json::Error,
    },

    /// An append targeted a session that is not current.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The default data directory could not be determined.
    #[error("Cannot determine data directory")]
    NoDataDir,
}

/// A specialized result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Store shared between the coordinator, the recorder and the upload queue.
pub type SharedStore = Arc<Mutex<SessionStore>>;

/// File-backed store for the current session, the session index and the
/// pending-export queue.
#[derive(Debug)]
pub struct SessionStore {
    data_dir: PathBuf,
    last_id: u64,
}

impl SessionStore {
    /// Open (or create) a store rooted at `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or an existing
    /// key file is corrupt.
    pub fn open(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let mut store = Self {
            data_dir,
            last_id: 0,
        };
        store.last_id = store.highest_known_id()?;
        debug!(data_dir = %store.data_dir.display(), last_id = store.last_id, "Opened session store");
        Ok(store)
    }

    /// Open a store and wrap it for sharing between services.
    ///
    /// # Errors
    ///
    /// See [`SessionStore::open`].
    pub fn open_shared(data_dir: impl Into<PathBuf>) -> StorageResult<SharedStore> {
        Ok(Arc::new(Mutex::new(Self::open(data_dir)?)))
    }

    /// Directory holding the key files.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Next strictly increasing timestamp-derived identifier.
    ///
    /// Shared by session and event ids, so an id handed out here is never
    /// reused on this device.
    pub fn next_timestamp_id(&mut self) -> u64 {
        self.last_id = next_timestamp_id(self.last_id);
        self.last_id
    }

    /// Build a fresh active session without persisting it.
    ///
    /// Callers that must publish remotely before committing locally use
    /// this, then [`SessionStore::set_current`].
    ///
    /// # Errors
    ///
    /// Returns [`PreconditionError::SessionAlreadyActive`] if a session is
    /// already current.
    pub fn begin_session(&mut self, role: Role) -> StorageResult<Session> {
        if let Some(current) = self.current_session()? {
            return Err(PreconditionError::SessionAlreadyActive(current.id).into());
        }
        let id = SessionId::from_millis(self.next_timestamp_id());
        Ok(Session::new(id, role, Utc::now()))
    }

    /// Create a new active session and persist it as current.
    ///
    /// # Errors
    ///
    /// Fails if a session is already current or the write fails.
    pub fn create_session(&mut self, role: Role) -> StorageResult<Session> {
        let session = self.begin_session(role)?;
        self.set_current(&session)?;
        Ok(session)
    }

    /// Persist `session` as the current session.
    ///
    /// A different session that was current is archived into the index
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    pub fn set_current(&mut self, session: &Session) -> StorageResult<()> {
        if let Some(previous) = self.current_session()? {
            if previous.id != session.id {
                debug!(session_id = %previous.id, "Archiving replaced current session");
                self.upsert_index(previous)?;
            }
        }
        if let Some(millis) = session.id.millis() {
            self.last_id = self.last_id.max(millis);
        }
        self.write_json(CURRENT_SESSION_FILE, session, "current session")
    }

    /// The session currently running on this device, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the key file cannot be read or parsed.
    pub fn current_session(&self) -> StorageResult<Option<Session>> {
        self.read_json(CURRENT_SESSION_FILE)
    }

    /// End the current session now. See [`SessionStore::finish_current`].
    ///
    /// # Errors
    ///
    /// Returns an error if a read or write fails.
    pub fn end_current_session(&mut self) -> StorageResult<Option<Session>> {
        self.finish_current(Utc::now())
    }

    /// Stamp `end_time`, mark the current session completed and move it into
    /// the index.
    ///
    /// Returns `None` without touching anything when no session is current.
    ///
    /// # Errors
    ///
    /// Returns an error if a read or write fails.
    pub fn finish_current(&mut self, end_time: DateTime<Utc>) -> StorageResult<Option<Session>> {
        let Some(mut session) = self.current_session()? else {
            return Ok(None);
        };

        session.end_time = Some(end_time);
        session.status = SessionStatus::Completed;

        self.upsert_index(session.clone())?;
        self.remove_file(CURRENT_SESSION_FILE)?;

        info!(session_id = %session.id, "Session ended locally");
        Ok(Some(session))
    }

    /// All known sessions (indexed plus current), ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if a key file cannot be read.
    pub fn list_sessions(&self) -> StorageResult<Vec<Session>> {
        let mut sessions = self.indexed_sessions()?;
        if let Some(current) = self.current_session()? {
            sessions.retain(|s| s.id != current.id);
            sessions.push(current);
        }
        sessions.sort_by(|a, b| compare_ids(&a.id, &b.id));
        Ok(sessions)
    }

    /// Append an event to the current session.
    ///
    /// # Errors
    ///
    /// Fails with a precondition error when the event's session is not
    /// current, or with an I/O error if the write fails.
    pub fn append_event(&mut self, event: ValidationEvent) -> StorageResult<()> {
        let mut session = self.require_current(&event.session_id)?;
        session.events.push(event);
        self.write_json(CURRENT_SESSION_FILE, &session, "current session")
    }

    /// Append a location sample to the current session.
    ///
    /// # Errors
    ///
    /// Same as [`SessionStore::append_event`].
    pub fn append_location_sample(&mut self, sample: LocationSample) -> StorageResult<()> {
        let mut session = self.require_current(&sample.session_id)?;
        session.location_data.push(sample);
        self.write_json(CURRENT_SESSION_FILE, &session, "current session")
    }

    /// Upsert a session mirrored from the remote store into the index.
    ///
    /// The current session is never overwritten this way.
    ///
    /// # Errors
    ///
    /// Returns an error if a read or write fails.
    pub fn merge_remote_session(&mut self, session: Session) -> StorageResult<()> {
        if let Some(current) = self.current_session()? {
            if current.id == session.id {
                return Ok(());
            }
        }
        self.upsert_index(session)
    }

    /// The persisted pending-export queue, in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns an error if the key file cannot be read.
    pub fn pending_exports(&self) -> StorageResult<Vec<PendingExport>> {
        Ok(self.read_json(PENDING_EXPORTS_FILE)?.unwrap_or_default())
    }

    /// Replace the persisted pending-export queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_pending_exports(&self, exports: &[PendingExport]) -> StorageResult<()> {
        self.write_json(PENDING_EXPORTS_FILE, &exports, "pending exports")
    }

    /// Irreversibly erase every local key.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be removed.
    pub fn clear_all(&mut self) -> StorageResult<()> {
        for file in [CURRENT_SESSION_FILE, SESSIONS_FILE, PENDING_EXPORTS_FILE] {
            self.remove_file(file)?;
        }
        info!(data_dir = %self.data_dir.display(), "Cleared all local session data");
        Ok(())
    }

    /// The current session, provided it is `session_id`.
    ///
    /// # Errors
    ///
    /// Fails with [`PreconditionError::NoActiveSession`] or
    /// [`PreconditionError::SessionMismatch`], or if the read fails.
    pub fn require_current(&self, session_id: &SessionId) -> StorageResult<Session> {
        let current = self
            .current_session()?
            .ok_or(PreconditionError::NoActiveSession)?;
        if &current.id != session_id {
            return Err(PreconditionError::SessionMismatch {
                requested: session_id.clone(),
                current: current.id,
            }
            .into());
        }
        Ok(current)
    }

    fn indexed_sessions(&self) -> StorageResult<Vec<Session>> {
        Ok(self.read_json(SESSIONS_FILE)?.unwrap_or_default())
    }

    fn upsert_index(&self, session: Session) -> StorageResult<()> {
        let mut sessions = self.indexed_sessions()?;
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => sessions.push(session),
        }
        sessions.sort_by(|a, b| compare_ids(&a.id, &b.id));
        self.write_json(SESSIONS_FILE, &sessions, "session index")
    }

    fn highest_known_id(&self) -> StorageResult<u64> {
        let indexed = self.indexed_sessions()?;
        let current = self.current_session()?;
        Ok(indexed
            .iter()
            .chain(current.iter())
            .flat_map(|s| {
                std::iter::once(s.id.millis())
                    .chain(s.events.iter().map(|e| e.event_id.parse().ok()))
            })
            .flatten()
            .max()
            .unwrap_or(0))
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> StorageResult<Option<T>> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let value =
            serde_json::from_str(&content).map_err(|source| StorageError::Corrupt { path, source })?;
        Ok(Some(value))
    }

    fn write_json<T: Serialize + ?Sized>(
        &self,
        file: &str,
        value: &T,
        what: &'static str,
    ) -> StorageResult<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|source| StorageError::Serialize { what, source })?;
        let path = self.path(file);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_file(&self, file: &str) -> StorageResult<()> {
        match std::fs::remove_file(self.path(file)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Numeric ids sort by value, anything else falls back to string order.
fn compare_ids(a: &SessionId, b: &SessionId) -> std::cmp::Ordering {
    match (a.millis(), b.millis()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Get the default data directory.
///
/// Uses the platform data directory for `convoy`
/// (e.g. `~/.local/share/convoy` on Linux).
///
/// # Errors
///
/// Returns [`StorageError::NoDataDir`] if no home directory is available.
pub fn default_data_dir() -> StorageResult<PathBuf> {
    directories::ProjectDirs::from("", "", "convoy")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, EventLocation, GeoPosition};
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn event_for(session_id: &SessionId, event_id: &str) -> ValidationEvent {
        ValidationEvent {
            event_id: event_id.to_string(),
            session_id: session_id.clone(),
            kind: EventKind::FauxPositif,
            timestamp: Utc::now(),
            location: EventLocation {
                position: GeoPosition::new(48.8566, 2.3522, 10.0),
                address: crate::types::Address::default(),
            },
            speed: 12.0,
            notes: String::new(),
        }
    }

    #[test]
    fn test_create_session_persists_current() {
        let (_dir, mut store) = store();
        let session = store.create_session(Role::Driver).unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(store.current_session().unwrap(), Some(session));
    }

    #[test]
    fn test_session_ids_are_fresh_and_monotonic() {
        let (_dir, mut store) = store();
        let first = store.create_session(Role::Driver).unwrap();
        store.end_current_session().unwrap();
        let second = store.create_session(Role::Driver).unwrap();

        assert_ne!(first.id, second.id);
        assert!(second.id.millis().unwrap() > first.id.millis().unwrap());
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let far_future = crate::types::now_millis() + 3_600_000;
        {
            let mut store = SessionStore::open(dir.path()).unwrap();
            let session = Session::new(SessionId::from_millis(far_future), Role::Validator, Utc::now());
            store.set_current(&session).unwrap();
        }
        let mut reopened = SessionStore::open(dir.path()).unwrap();
        assert_eq!(reopened.next_timestamp_id(), far_future + 1);
    }

    #[test]
    fn test_begin_session_refuses_when_current_exists() {
        let (_dir, mut store) = store();
        let current = store.create_session(Role::Driver).unwrap();

        let err = store.begin_session(Role::Driver).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Precondition(PreconditionError::SessionAlreadyActive(id)) if id == current.id
        ));
    }

    #[test]
    fn test_end_current_session_moves_to_index() {
        let (_dir, mut store) = store();
        let session = store.create_session(Role::Driver).unwrap();

        let ended = store.end_current_session().unwrap().unwrap();
        assert_eq!(ended.id, session.id);
        assert_eq!(ended.status, SessionStatus::Completed);
        assert!(ended.end_time.is_some());
        assert!(store.current_session().unwrap().is_none());

        let all = store.list_sessions().unwrap();
        assert_eq!(all, vec![ended]);
    }

    #[test]
    fn test_end_current_session_without_session_is_noop() {
        let (_dir, mut store) = store();
        assert!(store.end_current_session().unwrap().is_none());
        assert!(store.end_current_session().unwrap().is_none());
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_append_event_requires_matching_current_session() {
        let (_dir, mut store) = store();
        let orphan = event_for(&SessionId::new("1"), "2");
        let err = store.append_event(orphan).unwrap_err();
        assert!(matches!(err, StorageError::Precondition(PreconditionError::NoActiveSession)));

        let session = store.create_session(Role::Validator).unwrap();
        let wrong = event_for(&SessionId::new("1"), "3");
        let err = store.append_event(wrong).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Precondition(PreconditionError::SessionMismatch { .. })
        ));

        store.append_event(event_for(&session.id, "a")).unwrap();
        store.append_event(event_for(&session.id, "b")).unwrap();
        let ids: Vec<_> = store
            .current_session()
            .unwrap()
            .unwrap()
            .events
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_set_current_archives_replaced_session() {
        let (_dir, mut store) = store();
        let first = Session::new(SessionId::from_millis(100), Role::Validator, Utc::now());
        let second = Session::new(SessionId::from_millis(200), Role::Validator, Utc::now());

        store.set_current(&first).unwrap();
        store.set_current(&second).unwrap();

        assert_eq!(store.current_session().unwrap().unwrap().id, second.id);
        let ids: Vec<_> = store.list_sessions().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn test_merge_remote_session_skips_current() {
        let (_dir, mut store) = store();
        let current = store.create_session(Role::Validator).unwrap();

        let mut remote_copy = current.clone();
        remote_copy.status = SessionStatus::Completed;
        store.merge_remote_session(remote_copy).unwrap();

        let synced = Session::new(SessionId::from_millis(5), Role::Driver, Utc::now());
        store.merge_remote_session(synced.clone()).unwrap();

        let all = store.list_sessions().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], synced);
        assert_eq!(all[1].status, SessionStatus::Active);
    }

    #[test]
    fn test_clear_all_erases_everything() {
        let (_dir, mut store) = store();
        let session = store.create_session(Role::Driver).unwrap();
        store
            .save_pending_exports(&[PendingExport::new(session)])
            .unwrap();

        store.clear_all().unwrap();

        assert!(store.current_session().unwrap().is_none());
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(store.pending_exports().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (dir, store) = store();
        std::fs::write(dir.path().join(CURRENT_SESSION_FILE), "{not json").unwrap();

        let err = store.current_session().unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
