//! End-to-end scenarios across a driver and a validator sharing one remote store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio::sync::watch;

use convoy_core::remote::Listener;
use convoy_core::{
    ActiveSessionAnnouncement, ConvoyError, CoordinatorState, DeferredUploadQueue, EventKind,
    EventRecorder, ExportOutcome, ExportUploader, GeoPosition, MemoryRemoteStore, PendingExport,
    PreconditionError, RemoteError, RemoteResult, RemoteSessionChannel, RemoteStore, Role,
    Session, SessionCoordinator, SessionId, SessionStatus, SessionStore, SharedStore, Subscription,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Remote store that refuses writes while `offline` is set.
#[derive(Clone, Default)]
struct FlakyRemote {
    inner: MemoryRemoteStore,
    offline: Arc<AtomicBool>,
}

impl FlakyRemote {
    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("network down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()> {
        self.check()?;
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> RemoteResult<()> {
        self.check()?;
        self.inner.update(path, fields).await
    }

    async fn push(&self, path: &str, value: Value) -> RemoteResult<String> {
        self.check()?;
        self.inner.push(path, value).await
    }

    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        self.inner.get(path).await
    }

    fn subscribe(&self, path: &str, listener: Listener) -> RemoteResult<Subscription> {
        self.inner.subscribe(path, listener)
    }
}

/// Uploader failing for a configurable set of sessions.
#[derive(Default)]
struct SelectiveUploader {
    failing: Mutex<HashSet<SessionId>>,
    uploaded: Mutex<Vec<SessionId>>,
}

impl SelectiveUploader {
    fn fail_for(&self, id: &SessionId) {
        self.failing.lock().unwrap().insert(id.clone());
    }
}

#[async_trait]
impl ExportUploader for SelectiveUploader {
    async fn upload(&self, export: &PendingExport) -> RemoteResult<()> {
        if self.failing.lock().unwrap().contains(&export.session.id) {
            return Err(RemoteError::Upload {
                path: format!("sessions/{}/export.txt", export.session.id),
                message: "bucket unreachable".into(),
            });
        }
        self.uploaded.lock().unwrap().push(export.session.id.clone());
        Ok(())
    }
}

struct Device {
    _dir: TempDir,
    store: SharedStore,
    channel: RemoteSessionChannel,
}

impl Device {
    fn new(remote: Arc<dyn RemoteStore>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open_shared(dir.path()).unwrap();
        Self {
            _dir: dir,
            store,
            channel: RemoteSessionChannel::new(remote),
        }
    }

    fn coordinator(&self, role: Role) -> SessionCoordinator {
        SessionCoordinator::builder(role, Arc::clone(&self.store), self.channel.clone()).build()
    }

    fn recorder(&self) -> EventRecorder {
        EventRecorder::new(Arc::clone(&self.store), self.channel.clone())
    }
}

fn paris() -> Option<GeoPosition> {
    Some(GeoPosition::new(48.8566, 2.3522, 10.0))
}

async fn wait_for_state(
    rx: &mut watch::Receiver<CoordinatorState>,
    predicate: impl FnMut(&CoordinatorState) -> bool,
) -> CoordinatorState {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("coordinator did not reach the expected state")
        .unwrap()
        .clone()
}

// ============================================================================
// Recording
// ============================================================================

#[tokio::test]
async fn recorded_events_match_successful_calls_in_order() {
    let device = Device::new(Arc::new(MemoryRemoteStore::new()));
    let session = device.store.lock().await.create_session(Role::Validator).unwrap();
    let recorder = device.recorder();

    let kinds = [
        EventKind::FauxPositif,
        EventKind::DangerNonDetecte,
        EventKind::MoyenNonDetecte,
        EventKind::FauxPositif,
    ];
    let mut recorded = Vec::new();
    for (i, kind) in kinds.into_iter().enumerate() {
        let event = recorder
            .record(session.id.as_str(), kind, paris(), 10.0, format!("note {i}"))
            .await
            .unwrap();
        recorded.push(event);

        // A failing call in between must not show up in the list.
        recorder
            .record(session.id.as_str(), kind, None, 10.0, "")
            .await
            .unwrap_err();
    }

    let local = device.store.lock().await.current_session().unwrap().unwrap();
    assert_eq!(local.events, recorded);
    let ids: Vec<u64> = local.events.iter().map(|e| e.event_id.parse().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn record_without_session_fails_and_writes_nothing() {
    let remote = MemoryRemoteStore::new();
    let device = Device::new(Arc::new(remote.clone()));

    let err = device
        .recorder()
        .record("1736912400000", EventKind::DangerNonDetecte, paris(), 12.0, "")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConvoyError::Precondition(PreconditionError::NoActiveSession)
    ));
    assert!(device.store.lock().await.list_sessions().unwrap().is_empty());
    assert!(remote.snapshot().is_null());
}

#[tokio::test]
async fn remote_failure_leaves_local_session_untouched() {
    let remote = FlakyRemote::default();
    let device = Device::new(Arc::new(remote.clone()));
    let session = device.store.lock().await.create_session(Role::Validator).unwrap();

    remote.set_offline(true);
    let err = device
        .recorder()
        .record(session.id.as_str(), EventKind::FauxPositif, paris(), 5.0, "")
        .await
        .unwrap_err();
    assert!(err.is_remote_error());
    assert!(err.is_recoverable());

    let local = device.store.lock().await.current_session().unwrap().unwrap();
    assert!(local.events.is_empty());

    remote.set_offline(false);
    device
        .recorder()
        .record(session.id.as_str(), EventKind::FauxPositif, paris(), 5.0, "")
        .await
        .unwrap();
    let local = device.store.lock().await.current_session().unwrap().unwrap();
    assert_eq!(local.events.len(), 1);
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn created_sessions_get_fresh_increasing_ids() {
    let device = Device::new(Arc::new(MemoryRemoteStore::new()));
    let mut seen = HashSet::new();
    let mut last = 0;

    for _ in 0..5 {
        let session = device.store.lock().await.create_session(Role::Driver).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        let millis = session.id.millis().unwrap();
        assert!(millis > last);
        last = millis;
        assert!(seen.insert(session.id.clone()));
        device.store.lock().await.end_current_session().unwrap();
    }
}

#[tokio::test]
async fn ending_without_current_session_is_a_noop() {
    let device = Device::new(Arc::new(MemoryRemoteStore::new()));
    let mut store = device.store.lock().await;

    assert!(store.end_current_session().unwrap().is_none());
    assert!(store.end_current_session().unwrap().is_none());
    assert!(store.list_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn driver_remote_failure_does_not_commit_session() {
    let remote = FlakyRemote::default();
    let device = Device::new(Arc::new(remote.clone()));
    let driver = device.coordinator(Role::Driver);

    remote.set_offline(true);
    assert!(driver.start_session().await.unwrap_err().is_remote_error());
    assert!(driver.state().is_idle());
    assert!(device.store.lock().await.current_session().unwrap().is_none());

    remote.set_offline(false);
    let session = driver.start_session().await.unwrap();
    assert_eq!(driver.state().session_id(), Some(&session.id));
}

#[tokio::test]
async fn driver_end_failure_still_leaves_device_idle() {
    let remote = FlakyRemote::default();
    let device = Device::new(Arc::new(remote.clone()));
    let driver = device.coordinator(Role::Driver);
    driver.start_session().await.unwrap();

    remote.set_offline(true);
    assert!(driver.end_session().await.unwrap_err().is_remote_error());
    assert!(driver.state().is_idle());
    assert!(device.store.lock().await.current_session().unwrap().is_none());
}

// ============================================================================
// Announcements
// ============================================================================

#[tokio::test]
async fn driver_announcement_reaches_observer_once() {
    let remote = MemoryRemoteStore::new();
    let driver = Device::new(Arc::new(remote.clone()));
    let observer = RemoteSessionChannel::new(Arc::new(remote.clone()));

    let seen: Arc<Mutex<Vec<ActiveSessionAnnouncement>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _subscription = observer
        .observe_active_session(move |announcement| sink.lock().unwrap().push(announcement))
        .unwrap();

    let session = driver.store.lock().await.create_session(Role::Driver).unwrap();
    driver.channel.announce_active_session(&session).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].session_id, session.id);
    assert_eq!(seen[0].status, SessionStatus::Active);
}

#[tokio::test]
async fn validator_joins_announced_session_and_drops_old_subscription() {
    let remote = MemoryRemoteStore::new();
    let driver_device = Device::new(Arc::new(remote.clone()));
    let validator_device = Device::new(Arc::new(remote.clone()));
    let driver = driver_device.coordinator(Role::Driver);
    let validator = validator_device.coordinator(Role::Validator);
    let mut states = validator.subscribe_state();

    validator.watch_announcements().await.unwrap();
    let first = driver.start_session().await.unwrap();
    let joined = wait_for_state(&mut states, |s| s.session_id() == Some(&first.id)).await;
    assert_eq!(
        joined,
        CoordinatorState::Joined {
            session_id: first.id.clone()
        }
    );
    // announcement slot plus the joined session
    assert_eq!(remote.listener_count(), 2);

    // A second driver announcing wins over the joined session.
    let rival = Session::new(
        SessionId::from_millis(first.id.millis().unwrap() + 1_000),
        Role::Driver,
        Utc::now(),
    );
    driver_device.channel.publish_session(&rival).await.unwrap();
    driver_device.channel.announce_active_session(&rival).await.unwrap();

    wait_for_state(&mut states, |s| s.session_id() == Some(&rival.id)).await;
    assert_eq!(remote.listener_count(), 2);

    let local = validator_device.store.lock().await.current_session().unwrap().unwrap();
    assert_eq!(local.id, rival.id);

    validator.shutdown().await;
    assert_eq!(remote.listener_count(), 0);
}

#[tokio::test]
async fn validator_events_reach_driver_view() {
    let remote = MemoryRemoteStore::new();
    let driver_device = Device::new(Arc::new(remote.clone()));
    let validator_device = Device::new(Arc::new(remote.clone()));
    let driver = driver_device.coordinator(Role::Driver);
    let validator = validator_device.coordinator(Role::Validator);

    let session = driver.start_session().await.unwrap();
    validator.join(session.id.clone()).await.unwrap();

    validator_device
        .recorder()
        .record(session.id.as_str(), EventKind::MoyenNonDetecte, paris(), 9.5, "cyclist")
        .await
        .unwrap();
    driver_device
        .recorder()
        .record_location(session.id.as_str(), paris(), 13.0, 35.0)
        .await
        .unwrap();

    let synced = driver_device.channel.fetch_session(&session.id).await.unwrap().unwrap();
    assert_eq!(synced.events.len(), 1);
    assert_eq!(synced.events[0].notes, "cyclist");
    assert_eq!(synced.location_data.len(), 1);

    driver.end_session().await.unwrap();
    let completed = driver_device.channel.fetch_session(&session.id).await.unwrap().unwrap();
    assert_eq!(completed.status, SessionStatus::Completed);
    assert_eq!(completed.events.len(), 1);

    validator.shutdown().await;
}

// ============================================================================
// Deferred uploads
// ============================================================================

#[tokio::test]
async fn flush_keeps_only_the_failed_snapshot() {
    let device = Device::new(Arc::new(MemoryRemoteStore::new()));
    let uploader = Arc::new(SelectiveUploader::default());
    let queue = DeferredUploadQueue::new(Arc::clone(&device.store), uploader.clone());

    let a = Session::new(SessionId::new("1000"), Role::Driver, Utc::now());
    let b = Session::new(SessionId::new("2000"), Role::Driver, Utc::now());
    uploader.fail_for(&a.id);

    let entry_a = queue.enqueue(a).await.unwrap();
    queue.enqueue(b.clone()).await.unwrap();
    let report = queue.flush().await.unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(queue.pending().await.unwrap(), vec![entry_a]);
    assert_eq!(*uploader.uploaded.lock().unwrap(), vec![b.id]);
}

#[tokio::test]
async fn failed_export_at_session_end_is_queued() {
    let device = Device::new(Arc::new(MemoryRemoteStore::new()));
    let uploader = Arc::new(SelectiveUploader::default());
    let queue = DeferredUploadQueue::new(Arc::clone(&device.store), uploader.clone());
    let driver = SessionCoordinator::builder(
        Role::Driver,
        Arc::clone(&device.store),
        device.channel.clone(),
    )
    .uploads(queue.clone())
    .build();

    let session = driver.start_session().await.unwrap();
    uploader.fail_for(&session.id);
    let ended = driver.end_session().await.unwrap().unwrap();
    assert_eq!(ended.export, Some(ExportOutcome::Queued));

    let pending = queue.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].session.id, session.id);
    assert_eq!(pending[0].session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn retry_loop_drains_queue_after_recovery() {
    let device = Device::new(Arc::new(MemoryRemoteStore::new()));
    let uploader = Arc::new(SelectiveUploader::default());
    let queue = DeferredUploadQueue::new(Arc::clone(&device.store), uploader.clone());
    queue
        .enqueue(Session::new(SessionId::new("1"), Role::Validator, Utc::now()))
        .await
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = queue.spawn_retry_loop(Duration::from_millis(10), cancel.clone());

    let attempts = AtomicUsize::new(0);
    while !queue.pending().await.unwrap().is_empty() {
        assert!(attempts.fetch_add(1, Ordering::SeqCst) < 500, "queue never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    handle.await.unwrap();
}
