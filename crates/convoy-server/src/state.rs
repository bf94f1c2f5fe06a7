//! Composition root shared across handlers.
//!
//! Every service is constructed once here from [`Config`] and handed to the
//! handlers through [`AppState`]. Nothing in the core is a process-wide
//! singleton.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use convoy_core::config::{ObjectBackend, RemoteBackend};
use convoy_core::{
    connect_companion, transport_for, ArtifactStore, Config, DeferredUploadQueue, DeviceTransport,
    EventRecorder, FsObjectStore, Geocoder, HttpObjectStore, HttpRemoteStore, MemoryRemoteStore,
    NominatimGeocoder, ObjectStore, RemoteSessionChannel, RemoteStore, Role, SessionCoordinator,
    SessionStore, SharedStore,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared application state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: SharedStore,
    channel: RemoteSessionChannel,
    coordinator: SessionCoordinator,
    recorder: EventRecorder,
    artifacts: ArtifactStore,
    uploads: DeferredUploadQueue,
    transport: Arc<dyn DeviceTransport>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Build every service from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be opened or a
    /// backend cannot be constructed.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let data_dir = config.data_dir()?;
        let store = SessionStore::open_shared(&data_dir)
            .with_context(|| format!("opening data directory {}", data_dir.display()))?;

        let timeouts = config.remote.timeouts();
        let remote: Arc<dyn RemoteStore> = match config.remote.backend {
            RemoteBackend::Memory => Arc::new(MemoryRemoteStore::new()),
            RemoteBackend::Http => Arc::new(HttpRemoteStore::new(
                config
                    .remote
                    .base_url
                    .clone()
                    .context("remote.base_url is required for the http backend")?,
                config.remote.auth_token.clone(),
                Duration::from_millis(config.remote.poll_interval_ms),
                timeouts,
            )?),
        };

        let objects: Arc<dyn ObjectStore> = match config.uploads.backend {
            ObjectBackend::Fs => Arc::new(FsObjectStore::new(
                config
                    .uploads
                    .objects_dir
                    .clone()
                    .unwrap_or_else(|| data_dir.join("objects")),
            )),
            ObjectBackend::Http => Arc::new(HttpObjectStore::new(
                config
                    .uploads
                    .base_url
                    .clone()
                    .context("uploads.base_url is required for the http backend")?,
                config.remote.auth_token.clone(),
                timeouts,
            )?),
        };

        let geocoder: Option<Arc<dyn Geocoder>> = match config.geocoding.base_url.clone() {
            Some(url) => Some(Arc::new(NominatimGeocoder::new(url, timeouts)?)),
            None => None,
        };

        let transport = transport_for(&config.transport);
        Ok(Self::from_parts(config, store, remote, objects, transport, geocoder))
    }

    /// Wire the services over already constructed backends.
    #[must_use]
    pub fn from_parts(
        config: Config,
        store: SharedStore,
        remote: Arc<dyn RemoteStore>,
        objects: Arc<dyn ObjectStore>,
        transport: Arc<dyn DeviceTransport>,
        geocoder: Option<Arc<dyn Geocoder>>,
    ) -> Self {
        let channel = RemoteSessionChannel::new(remote);
        let artifacts = ArtifactStore::new(objects);
        let uploads = DeferredUploadQueue::new(Arc::clone(&store), Arc::new(artifacts.clone()));

        let mut builder =
            SessionCoordinator::builder(config.device.role, Arc::clone(&store), channel.clone())
                .uploads(uploads.clone());
        if config.device.role == Role::Driver {
            builder = builder.transport(Arc::clone(&transport));
        }
        let coordinator = builder.build();

        let mut recorder = EventRecorder::new(Arc::clone(&store), channel.clone())
            .with_transport(Arc::clone(&transport));
        if let Some(geocoder) = geocoder {
            recorder = recorder.with_geocoder(geocoder);
        }

        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                channel,
                coordinator,
                recorder,
                artifacts,
                uploads,
                transport,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the retry loop, restore the persisted session and begin
    /// watching for announcements (validator) or connecting the companion
    /// (driver).
    ///
    /// # Errors
    ///
    /// Returns an error if the validator cannot subscribe to announcements.
    pub async fn start_background(&self) -> anyhow::Result<()> {
        let config = &self.inner.config;
        let mut tasks = self.inner.tasks.lock().await;

        tasks.push(self.inner.uploads.spawn_retry_loop(
            Duration::from_secs(config.uploads.retry_interval_secs),
            self.inner.cancel.child_token(),
        ));

        if config.device.role == Role::Driver && config.transport.auto_connect {
            let transport = Arc::clone(&self.inner.transport);
            let name = config.transport.companion_name.clone();
            let timeout = Duration::from_secs(config.transport.scan_timeout_secs);
            let cancel = self.inner.cancel.child_token();
            tasks.push(tokio::spawn(async move {
                let connect = async {
                    transport.initialize().await?;
                    connect_companion(transport.as_ref(), &name, timeout).await
                };
                tokio::select! {
                    () = cancel.cancelled() => {}
                    result = connect => {
                        if let Err(err) = result {
                            warn!(error = %err, "Companion auto-connect failed");
                        }
                    }
                }
            }));
        }
        drop(tasks);

        match self.inner.coordinator.restore().await {
            Ok(state) => info!(state = ?state, "Coordinator restored"),
            Err(err) => warn!(error = %err, "Failed to restore the persisted session"),
        }

        if config.device.role == Role::Validator {
            self.inner.coordinator.watch_announcements().await?;
        }

        info!(role = %config.device.role, device = %config.device.name, "Background services started");
        Ok(())
    }

    /// Stop background tasks and cancel every subscription.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.coordinator.shutdown().await;

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task ended abnormally");
            }
        }
        info!("Background services stopped");
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Local session store.
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    /// Remote session channel.
    #[must_use]
    pub fn channel(&self) -> &RemoteSessionChannel {
        &self.inner.channel
    }

    /// Session lifecycle coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.inner.coordinator
    }

    /// Event and telemetry recorder.
    #[must_use]
    pub fn recorder(&self) -> &EventRecorder {
        &self.inner.recorder
    }

    /// Session artifacts in object storage.
    #[must_use]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    /// Deferred export uploads.
    #[must_use]
    pub fn uploads(&self) -> &DeferredUploadQueue {
        &self.inner.uploads
    }

    /// Companion hardware transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.inner.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::config::StorageConfig;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, role: Role) -> Config {
        let mut config = Config::default();
        config.device.role = role;
        config.storage = StorageConfig {
            data_dir: Some(dir.path().to_path_buf()),
        };
        config.transport.auto_connect = false;
        config
    }

    #[tokio::test]
    async fn test_new_builds_from_default_backends() {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(config_in(&dir, Role::Validator)).unwrap();
        assert_eq!(state.coordinator().role(), Role::Validator);
        assert!(state.store().lock().await.current_session().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_background_lifecycle() {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(config_in(&dir, Role::Validator)).unwrap();

        state.start_background().await.unwrap();
        assert!(state.coordinator().state().is_idle());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_geocoder_is_wired_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir, Role::Driver);
        config.geocoding.base_url = Some("https://nominatim.example.com".into());
        AppState::new(config).unwrap();
    }
}
