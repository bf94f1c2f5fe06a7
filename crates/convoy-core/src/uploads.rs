//! Deferred export uploads.
//!
//! When a session ends its export is uploaded right away. If that fails
//! the snapshot goes into the persisted pending-export queue, and a
//! background loop retries the whole queue on a fixed interval until each
//! entry succeeds. There is no retry limit and no backoff: an entry stays
//! queued until it uploads or the user clears local data.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::remote::RemoteResult;
use crate::storage::{SharedStore, StorageResult};
use crate::types::{PendingExport, Session};

/// Destination of session exports.
#[async_trait]
pub trait ExportUploader: Send + Sync {
    /// Upload one queued snapshot.
    async fn upload(&self, export: &PendingExport) -> RemoteResult<()>;
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FlushReport {
    /// Entries that were tried.
    #[schema(example = 2)]
    pub attempted: usize,

    /// Entries that uploaded and left the queue.
    #[schema(example = 1)]
    pub uploaded: usize,

    /// Entries still queued.
    #[schema(example = 1)]
    pub remaining: usize,
}

/// What happened to an export submitted at session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExportOutcome {
    /// Uploaded on the first try.
    Uploaded,
    /// Upload failed. The snapshot waits in the pending queue.
    Queued,
}

/// Persisted queue of exports waiting for a successful upload.
#[derive(Clone)]
pub struct DeferredUploadQueue {
    store: SharedStore,
    uploader: Arc<dyn ExportUploader>,
    gate: Arc<Mutex<()>>,
}

impl DeferredUploadQueue {
    /// Create a queue persisted in `store` that uploads through `uploader`.
    pub fn new(store: SharedStore, uploader: Arc<dyn ExportUploader>) -> Self {
        Self {
            store,
            uploader,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Append a snapshot of `session` to the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub async fn enqueue(&self, session: Session) -> StorageResult<PendingExport> {
        let entry = PendingExport::new(session);
        self.push(entry.clone()).await?;
        Ok(entry)
    }

    /// Snapshot of the queue, in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub async fn pending(&self) -> StorageResult<Vec<PendingExport>> {
        self.store.lock().await.pending_exports()
    }

    /// Try every queued snapshot once, in order.
    ///
    /// Exactly the entries whose upload succeeded are removed. The others
    /// stay in place with unchanged content and relative order. Entries
    /// enqueued while a flush runs wait for it and land after the
    /// survivors. The store is not locked during uploads, and entries
    /// erased meanwhile by [`SessionStore::clear_all`] stay erased.
    ///
    /// [`SessionStore::clear_all`]: crate::storage::SessionStore::clear_all
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or written back.
    pub async fn flush(&self) -> StorageResult<FlushReport> {
        let _gate = self.gate.lock().await;

        let pending = self.store.lock().await.pending_exports()?;
        if pending.is_empty() {
            return Ok(FlushReport::default());
        }

        let attempted = pending.len();
        let mut uploaded = HashSet::with_capacity(attempted);
        for entry in &pending {
            match self.uploader.upload(entry).await {
                Ok(()) => {
                    debug!(session_id = %entry.session.id, export_id = %entry.id, "Queued export uploaded");
                    uploaded.insert(entry.id);
                }
                Err(err) => {
                    warn!(
                        session_id = %entry.session.id,
                        export_id = %entry.id,
                        queued_at = %entry.queued_at,
                        error = %err,
                        "Export upload failed, keeping it queued"
                    );
                }
            }
        }

        // The queue may have been cleared while uploads ran.
        let store = self.store.lock().await;
        let mut persisted = store.pending_exports()?;
        persisted.retain(|entry| !uploaded.contains(&entry.id));
        store.save_pending_exports(&persisted)?;
        drop(store);

        let report = FlushReport {
            attempted,
            uploaded: uploaded.len(),
            remaining: attempted - uploaded.len(),
        };
        info!(
            attempted = report.attempted,
            uploaded = report.uploaded,
            remaining = report.remaining,
            "Flushed pending exports"
        );
        Ok(report)
    }

    /// Upload the export of a just-ended session, queueing it on failure.
    ///
    /// # Errors
    ///
    /// Returns an error only if the failed snapshot cannot be queued.
    pub async fn submit(&self, session: Session) -> StorageResult<ExportOutcome> {
        let entry = PendingExport::new(session);
        match self.uploader.upload(&entry).await {
            Ok(()) => {
                info!(session_id = %entry.session.id, "Session export uploaded");
                Ok(ExportOutcome::Uploaded)
            }
            Err(err) => {
                warn!(session_id = %entry.session.id, error = %err, "Session export failed, queued for retry");
                self.push(entry).await?;
                Ok(ExportOutcome::Queued)
            }
        }
    }

    /// Flush every `period` until `cancel` fires.
    ///
    /// The first pass runs one full period after the call. Passes over an
    /// empty queue do nothing.
    pub fn spawn_retry_loop(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_secs = period.as_secs(), "Export retry loop started");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = queue.flush().await {
                    warn!(error = %err, "Export retry pass failed");
                }
            }
            info!("Export retry loop stopped");
        })
    }

    async fn push(&self, entry: PendingExport) -> StorageResult<()> {
        let _gate = self.gate.lock().await;
        let store = self.store.lock().await;
        let mut pending = store.pending_exports()?;
        debug!(session_id = %entry.session.id, queued = pending.len() + 1, "Queueing export");
        pending.push(entry);
        store.save_pending_exports(&pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use crate::storage::SessionStore;
    use crate::types::{Role, SessionId};
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Fails for every session id in `failing`.
    #[derive(Default)]
    struct FlakyUploader {
        failing: StdMutex<HashSet<SessionId>>,
        calls: AtomicUsize,
    }

    impl FlakyUploader {
        fn failing(ids: &[&SessionId]) -> Self {
            Self {
                failing: StdMutex::new(ids.iter().map(|id| (*id).clone()).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl ExportUploader for FlakyUploader {
        async fn upload(&self, export: &PendingExport) -> RemoteResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&export.session.id) {
                return Err(RemoteError::Upload {
                    path: format!("sessions/{}/export.txt", export.session.id),
                    message: "offline".into(),
                });
            }
            Ok(())
        }
    }

    fn session(millis: u64) -> Session {
        Session::new(SessionId::from_millis(millis), Role::Driver, Utc::now())
    }

    fn queue(uploader: Arc<FlakyUploader>) -> (TempDir, DeferredUploadQueue) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open_shared(dir.path()).unwrap();
        (dir, DeferredUploadQueue::new(store, uploader))
    }

    #[tokio::test]
    async fn test_flush_removes_only_successful_uploads() {
        let a = session(1);
        let b = session(2);
        let c = session(3);
        let uploader = Arc::new(FlakyUploader::failing(&[&a.id, &c.id]));
        let (_dir, queue) = queue(Arc::clone(&uploader));

        let entry_a = queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();
        let entry_c = queue.enqueue(c).await.unwrap();

        let report = queue.flush().await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                attempted: 3,
                uploaded: 1,
                remaining: 2
            }
        );
        assert_eq!(queue.pending().await.unwrap(), vec![entry_a, entry_c]);
    }

    #[tokio::test]
    async fn test_flush_empty_queue_does_not_call_uploader() {
        let uploader = Arc::new(FlakyUploader::default());
        let (_dir, queue) = queue(Arc::clone(&uploader));

        assert_eq!(queue.flush().await.unwrap(), FlushReport::default());
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_entries_retry_until_success() {
        let a = session(1);
        let uploader = Arc::new(FlakyUploader::failing(&[&a.id]));
        let (_dir, queue) = queue(Arc::clone(&uploader));
        queue.enqueue(a).await.unwrap();

        for _ in 0..3 {
            assert_eq!(queue.flush().await.unwrap().remaining, 1);
        }
        uploader.heal();
        assert_eq!(queue.flush().await.unwrap().uploaded, 1);
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_queues_on_failure() {
        let a = session(1);
        let b = session(2);
        let uploader = Arc::new(FlakyUploader::failing(&[&a.id]));
        let (_dir, queue) = queue(uploader);

        assert_eq!(queue.submit(a.clone()).await.unwrap(), ExportOutcome::Queued);
        assert_eq!(queue.submit(b).await.unwrap(), ExportOutcome::Uploaded);

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session, a);
    }

    #[tokio::test]
    async fn test_retry_loop_flushes_and_stops_on_cancel() {
        let a = session(1);
        let uploader = Arc::new(FlakyUploader::default());
        let (_dir, queue) = queue(Arc::clone(&uploader));
        queue.enqueue(a).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = queue.spawn_retry_loop(Duration::from_millis(20), cancel.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.pending().await.unwrap().is_empty() {
            assert!(Instant::now() < deadline, "retry loop never flushed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    /// Fails every upload after a delay.
    struct SlowFailingUploader(Duration);

    #[async_trait]
    impl ExportUploader for SlowFailingUploader {
        async fn upload(&self, export: &PendingExport) -> RemoteResult<()> {
            tokio::time::sleep(self.0).await;
            Err(RemoteError::Upload {
                path: format!("sessions/{}/export.txt", export.session.id),
                message: "offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_clear_during_flush_stays_cleared() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open_shared(dir.path()).unwrap();
        let queue = DeferredUploadQueue::new(
            Arc::clone(&store),
            Arc::new(SlowFailingUploader(Duration::from_millis(300))),
        );
        queue.enqueue(session(1)).await.unwrap();

        let flushing = tokio::spawn({
            let queue = queue.clone();
            async move { queue.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.lock().await.clear_all().unwrap();

        let report = flushing.await.unwrap().unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.uploaded, 0);
        assert!(queue.pending().await.unwrap().is_empty());
    }
}
