//! Session lifecycle across the driver and validator devices.
//!
//! ```text
//! driver:     Idle --start_session--> Active --end_session--> Idle
//! validator:  Idle --join / announcement--> Joined --completed | end_session | leave--> Idle
//! ```
//!
//! Remote notifications (announcements, session changes) never touch the
//! state directly. Listener callbacks push a [`Signal`] into an unbounded
//! channel and one worker task per coordinator applies them in order, so
//! every transition is serialized. Locks are always taken in the order
//! links, then store.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::bluetooth::DeviceTransport;
use crate::error::{ConvoyError, PreconditionError, Result};
use crate::remote::{RemoteSessionChannel, Subscription};
use crate::storage::SharedStore;
use crate::types::{ActiveSessionAnnouncement, Role, Session, SessionId, SessionStatus};
use crate::uploads::{DeferredUploadQueue, ExportOutcome};

/// Where this device is in the session lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CoordinatorState {
    /// No session.
    #[default]
    Idle,
    /// Driver running its own session.
    Active {
        /// The running session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// Validator following a driver's session.
    Joined {
        /// The followed session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
}

impl CoordinatorState {
    /// The session this state refers to, if any.
    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Idle => None,
            Self::Active { session_id } | Self::Joined { session_id } => Some(session_id),
        }
    }

    /// Whether no session is running or followed.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// A session that just ended on this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndedSession {
    /// Final local copy.
    pub session: Session,
    /// What happened to its export, when an upload queue is wired.
    pub export: Option<ExportOutcome>,
}

#[derive(Debug)]
enum Signal {
    Announced(ActiveSessionAnnouncement),
    SessionChanged(SessionId, Session),
}

#[derive(Default)]
struct Links {
    session: Option<(SessionId, Subscription)>,
    announcements: Option<Subscription>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    role: Role,
    store: SharedStore,
    channel: RemoteSessionChannel,
    uploads: Option<DeferredUploadQueue>,
    transport: Option<Arc<dyn DeviceTransport>>,
    state: watch::Sender<CoordinatorState>,
    mirror: watch::Sender<Option<Session>>,
    links: Mutex<Links>,
    signals: mpsc::UnboundedSender<Signal>,
    signal_rx: StdMutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    cancel: CancellationToken,
}

/// Builder for [`SessionCoordinator`].
pub struct SessionCoordinatorBuilder {
    role: Role,
    store: SharedStore,
    channel: RemoteSessionChannel,
    uploads: Option<DeferredUploadQueue>,
    transport: Option<Arc<dyn DeviceTransport>>,
}

impl SessionCoordinatorBuilder {
    /// Upload the export of every ended session, queueing failures.
    #[must_use]
    pub fn uploads(mut self, uploads: DeferredUploadQueue) -> Self {
        self.uploads = Some(uploads);
        self
    }

    /// Require the companion device to be connected before a driver
    /// session can start.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn DeviceTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the coordinator in the `Idle` state.
    #[must_use]
    pub fn build(self) -> SessionCoordinator {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        SessionCoordinator {
            inner: Arc::new(Inner {
                role: self.role,
                store: self.store,
                channel: self.channel,
                uploads: self.uploads,
                transport: self.transport,
                state: watch::Sender::new(CoordinatorState::Idle),
                mirror: watch::Sender::new(None),
                links: Mutex::new(Links::default()),
                signals,
                signal_rx: StdMutex::new(Some(signal_rx)),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

/// Orchestrates create, join and end for one device.
///
/// Cheap to clone. All clones drive the same state machine.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Start building a coordinator for `role`.
    pub fn builder(
        role: Role,
        store: SharedStore,
        channel: RemoteSessionChannel,
    ) -> SessionCoordinatorBuilder {
        SessionCoordinatorBuilder {
            role,
            store,
            channel,
            uploads: None,
            transport: None,
        }
    }

    /// Role this device plays.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.inner.state.borrow().clone()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state.subscribe()
    }

    /// Latest remote copy of the joined session (validator only).
    #[must_use]
    pub fn mirrored_session(&self) -> watch::Receiver<Option<Session>> {
        self.inner.mirror.subscribe()
    }

    /// The shared channel this coordinator publishes on.
    #[must_use]
    pub fn channel(&self) -> &RemoteSessionChannel {
        &self.inner.channel
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// Create, publish and announce a new session.
    ///
    /// The session is committed locally only after the remote publish and
    /// announcement succeeded. The store is not locked during those writes.
    ///
    /// # Errors
    ///
    /// Fails with a precondition error if this device is not a driver, a
    /// session is already running or the companion is not connected, and
    /// with a remote or storage error if a write fails.
    pub async fn start_session(&self) -> Result<Session> {
        self.require_role(Role::Driver)?;
        if let Some(id) = self.state().session_id() {
            return Err(PreconditionError::SessionAlreadyActive(id.clone()).into());
        }
        if let Some(transport) = &self.inner.transport {
            if !transport.is_connected() {
                return Err(PreconditionError::DeviceNotConnected.into());
            }
        }

        let links = self.inner.links.lock().await;
        let session = self.inner.store.lock().await.begin_session(Role::Driver)?;

        self.inner.channel.publish_session(&session).await?;
        self.inner.channel.announce_active_session(&session).await?;

        let mut store = self.inner.store.lock().await;
        if let Some(current) = store.current_session()? {
            return Err(PreconditionError::SessionAlreadyActive(current.id).into());
        }
        store.set_current(&session)?;
        drop(store);
        drop(links);

        self.set_state(CoordinatorState::Active {
            session_id: session.id.clone(),
        });
        info!(session_id = %session.id, "Driver session started");
        Ok(session)
    }

    /// End the current session.
    ///
    /// A no-op returning `None` when nothing is running. Otherwise the
    /// local copy is ended first and the device is `Idle` from then on.
    /// The driver then marks the session completed remotely and on the
    /// announcement slot. Both roles submit the export when an upload
    /// queue is wired.
    ///
    /// # Errors
    ///
    /// A remote failure is returned after the local end and the export,
    /// which are not rolled back.
    pub async fn end_session(&self) -> Result<Option<EndedSession>> {
        let mut links = self.inner.links.lock().await;
        let dropped = links.session.take();
        let ended = self.inner.store.lock().await.end_current_session()?;
        drop(links);

        if let Some((id, subscription)) = dropped {
            subscription.cancel();
            debug!(session_id = %id, "Session subscription cancelled");
        }
        self.inner.mirror.send_replace(None);
        self.set_state(CoordinatorState::Idle);

        let Some(session) = ended else {
            debug!("No current session to end");
            return Ok(None);
        };
        info!(session_id = %session.id, role = %self.role(), "Session ended");

        let remote = match self.role() {
            Role::Driver => self.publish_completion(&session).await,
            Role::Validator => Ok(()),
        };
        let export = self.submit_export(&session).await?;

        remote?;
        Ok(Some(EndedSession { session, export }))
    }

    async fn publish_completion(&self, session: &Session) -> Result<()> {
        self.inner
            .channel
            .update_session_status(&session.id, SessionStatus::Completed, session.end_time)
            .await?;
        self.inner.channel.announce_active_session(session).await?;
        Ok(())
    }

    // ========================================================================
    // Validator
    // ========================================================================

    /// Follow every session the driver announces.
    ///
    /// Each `active` announcement for a session other than the joined one
    /// triggers [`SessionCoordinator::join`]. The newest announcement wins.
    ///
    /// # Errors
    ///
    /// Fails if this device is not a validator or the subscription cannot
    /// be registered.
    pub async fn watch_announcements(&self) -> Result<()> {
        self.require_role(Role::Validator)?;
        let mut links = self.inner.links.lock().await;
        self.ensure_worker(&mut links);

        let signals = self.inner.signals.clone();
        let subscription = self.inner.channel.observe_active_session(move |announcement| {
            let _ = signals.send(Signal::Announced(announcement));
        })?;
        if links.announcements.replace(subscription).is_some() {
            debug!("Replaced previous announcement subscription");
        }
        info!("Watching for announced sessions");
        Ok(())
    }

    /// Join `session_id` and mirror it until it completes.
    ///
    /// Any previous session subscription is cancelled before the new one
    /// is registered, and its local copy is ended. Joining the session
    /// already joined is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with a precondition error for a driver or for a blank id or one
    /// spanning several remote path segments, and with
    /// a remote or storage error if a write fails. The previous session
    /// stays left in that case.
    pub async fn join(&self, session_id: SessionId) -> Result<()> {
        self.require_role(Role::Validator)?;
        let session_id = SessionId::parse(session_id.as_str())?;

        let mut links = self.inner.links.lock().await;
        if let Some((joined, _)) = &links.session {
            if *joined == session_id {
                return Ok(());
            }
        }
        self.ensure_worker(&mut links);

        if let Some((previous, subscription)) = links.session.take() {
            subscription.cancel();
            self.inner.mirror.send_replace(None);
            let mut store = self.inner.store.lock().await;
            if store.current_session()?.is_some_and(|s| s.id == previous) {
                store.end_current_session()?;
            }
            drop(store);
            self.set_state(CoordinatorState::Idle);
            info!(previous = %previous, next = %session_id, "Leaving session for a newer one");
        }

        self.inner.channel.mark_follower_joined(&session_id).await?;
        let signals = self.inner.signals.clone();
        let observed = session_id.clone();
        let subscription = self.inner.channel.observe_session(&session_id, move |session| {
            let _ = signals.send(Signal::SessionChanged(observed.clone(), session));
        })?;
        links.session = Some((session_id.clone(), subscription));

        let mut store = self.inner.store.lock().await;
        if !store.current_session()?.is_some_and(|s| s.id == session_id) {
            store.set_current(&Session::new(session_id.clone(), Role::Validator, Utc::now()))?;
        }
        drop(store);
        drop(links);

        self.set_state(CoordinatorState::Joined {
            session_id: session_id.clone(),
        });
        info!(session_id = %session_id, "Joined session");
        Ok(())
    }

    /// Stop following the joined session without exporting it.
    ///
    /// The local copy is ended. A no-op when idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the local copy cannot be ended.
    pub async fn leave(&self) -> Result<Option<Session>> {
        self.require_role(Role::Validator)?;
        let mut links = self.inner.links.lock().await;
        let Some((id, subscription)) = links.session.take() else {
            return Ok(None);
        };
        subscription.cancel();
        let ended = self.inner.store.lock().await.end_current_session()?;
        drop(links);

        self.inner.mirror.send_replace(None);
        self.set_state(CoordinatorState::Idle);
        info!(session_id = %id, "Left session");
        Ok(ended)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resume after a restart from the persisted current session.
    ///
    /// A driver goes back to `Active`. A validator re-joins.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or re-joining fails.
    pub async fn restore(&self) -> Result<CoordinatorState> {
        let current = self.inner.store.lock().await.current_session()?;
        let Some(session) = current else {
            return Ok(self.state());
        };

        match self.role() {
            Role::Driver => {
                info!(session_id = %session.id, "Resuming driver session");
                self.set_state(CoordinatorState::Active {
                    session_id: session.id,
                });
            }
            Role::Validator => {
                info!(session_id = %session.id, "Re-joining session");
                self.join(session.id).await?;
            }
        }
        Ok(self.state())
    }

    /// Detach from every session and erase all local data.
    ///
    /// # Errors
    ///
    /// Returns an error if a key file cannot be removed.
    pub async fn reset(&self) -> Result<()> {
        let mut links = self.inner.links.lock().await;
        links.session.take();
        self.inner.store.lock().await.clear_all()?;
        drop(links);

        self.inner.mirror.send_replace(None);
        self.set_state(CoordinatorState::Idle);
        warn!("All local session data cleared");
        Ok(())
    }

    /// Cancel every subscription and stop the worker task.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let (session, announcements, worker) = {
            let mut links = self.inner.links.lock().await;
            (
                links.session.take(),
                links.announcements.take(),
                links.worker.take(),
            )
        };
        drop(session);
        drop(announcements);
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "Coordinator worker ended abnormally");
            }
        }
        debug!("Coordinator shut down");
    }

    // ========================================================================
    // Worker
    // ========================================================================

    fn ensure_worker(&self, links: &mut Links) {
        if links.worker.is_some() {
            return;
        }
        let receiver = self
            .inner
            .signal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            return;
        };
        links.worker = Some(tokio::spawn(run_worker(
            Arc::downgrade(&self.inner),
            receiver,
            self.inner.cancel.clone(),
        )));
    }

    async fn handle(&self, signal: Signal) {
        match signal {
            Signal::Announced(announcement) => self.on_announcement(announcement).await,
            Signal::SessionChanged(id, session) => {
                if let Err(err) = self.on_session_changed(&id, session).await {
                    warn!(session_id = %id, error = %err, "Failed to apply remote session change");
                }
            }
        }
    }

    async fn on_announcement(&self, announcement: ActiveSessionAnnouncement) {
        if announcement.status != SessionStatus::Active {
            debug!(session_id = %announcement.session_id, "Ignoring announcement of a completed session");
            return;
        }
        if self.state().session_id() == Some(&announcement.session_id) {
            return;
        }
        info!(session_id = %announcement.session_id, "Session announced");
        if let Err(err) = self.join(announcement.session_id.clone()).await {
            warn!(session_id = %announcement.session_id, error = %err, "Failed to join announced session");
        }
    }

    async fn on_session_changed(&self, id: &SessionId, session: Session) -> Result<()> {
        let mut links = self.inner.links.lock().await;
        if links.session.as_ref().map(|(joined, _)| joined) != Some(id) {
            debug!(session_id = %id, "Ignoring change from a stale subscription");
            return Ok(());
        }

        let completed = session.status == SessionStatus::Completed;
        let end_time = session.end_time.unwrap_or_else(Utc::now);
        self.inner.mirror.send_replace(Some(session));
        if !completed {
            return Ok(());
        }

        links.session.take();
        let ended = {
            let mut store = self.inner.store.lock().await;
            if store.current_session()?.is_some_and(|s| s.id == *id) {
                store.finish_current(end_time)?
            } else {
                None
            }
        };
        drop(links);

        self.set_state(CoordinatorState::Idle);
        info!(session_id = %id, "Driver completed the session");
        if let Some(session) = ended {
            self.submit_export(&session).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn require_role(&self, expected: Role) -> Result<()> {
        if self.role() == expected {
            Ok(())
        } else {
            Err(PreconditionError::WrongRole {
                expected,
                actual: self.role(),
            }
            .into())
        }
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = self.inner.state.send_replace(state.clone());
        if previous != state {
            debug!(from = ?previous, to = ?state, "Coordinator state changed");
        }
    }

    async fn submit_export(&self, session: &Session) -> Result<Option<ExportOutcome>> {
        let Some(uploads) = &self.inner.uploads else {
            return Ok(None);
        };
        uploads
            .submit(session.clone())
            .await
            .map(Some)
            .map_err(ConvoyError::from)
    }
}

async fn run_worker(
    inner: Weak<Inner>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            signal = signals.recv() => signal,
        };
        let Some(signal) = signal else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        SessionCoordinator { inner }.handle(signal).await;
    }
    debug!("Coordinator worker stopped");
}
