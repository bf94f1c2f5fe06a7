//! Secondary object storage for session artifacts.
//!
//! Every artifact is addressed by a path under its session:
//!
//! - `sessions/{id}/export.txt` - text export of the session
//! - `sessions/{id}/videos/video_{n}.mp4` - clips pulled from the companion unit

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::export::ExportDocument;
use crate::remote::{HttpTimeouts, RemoteError, RemoteResult};
use crate::types::{PendingExport, Session, SessionId};
use crate::uploads::ExportUploader;

/// Content type of text exports.
pub const TEXT_PLAIN: &str = "text/plain";

/// Content type of video clips.
pub const VIDEO_MP4: &str = "video/mp4";

/// Blob storage addressed by slash-separated paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path` and return a URL for it.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> RemoteResult<String>;
}

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Store objects below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Local file backing `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidPath`] for a malformed path.
    pub fn file_for(&self, path: &str) -> RemoteResult<PathBuf> {
        Ok(object_segments(path)?
            .into_iter()
            .fold(self.root.clone(), |acc, s| acc.join(s)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> RemoteResult<String> {
        let file = self.file_for(path)?;
        let upload_err = |err: std::io::Error| RemoteError::Upload {
            path: path.to_string(),
            message: err.to_string(),
        };

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }
        tokio::fs::write(&file, bytes).await.map_err(upload_err)?;
        debug!(path, file = %file.display(), "Stored object");
        Ok(format!("file://{}", file.display()))
    }
}

/// Object store that `PUT`s to an HTTP bucket endpoint.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpObjectStore {
    /// Upload to `{base_url}/{path}`, with an optional bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeouts: HttpTimeouts,
    ) -> RemoteResult<Self> {
        Ok(Self {
            client: timeouts.client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> RemoteResult<String> {
        let url = format!("{}/{}", self.base_url, object_segments(path)?.join("/"));
        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| RemoteError::Upload {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(RemoteError::Upload {
                path: path.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        debug!(path, "Uploaded object");
        Ok(url)
    }
}

/// Split an object path, refusing traversal and empty paths.
fn object_segments(path: &str) -> RemoteResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let traversal = segments
        .iter()
        .any(|s| *s == "." || *s == ".." || s.contains('\\'));
    if segments.is_empty() || traversal {
        return Err(RemoteError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

/// Session artifacts on top of an [`ObjectStore`].
#[derive(Clone)]
pub struct ArtifactStore {
    objects: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    /// Wrap an object store.
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// `sessions/{id}/export.txt`
    #[must_use]
    pub fn export_path(id: &SessionId) -> String {
        format!("sessions/{id}/export.txt")
    }

    /// `sessions/{id}/videos/video_{index}.mp4`
    #[must_use]
    pub fn video_path(id: &SessionId, index: usize) -> String {
        format!("sessions/{id}/videos/video_{index}.mp4")
    }

    /// Render and store the export of one session.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or the upload fails.
    pub async fn upload_export(&self, session: &Session) -> RemoteResult<String> {
        let text = ExportDocument::for_session(session.clone())
            .render()
            .map_err(|err| RemoteError::Encode(err.to_string()))?;
        self.objects
            .put(&Self::export_path(&session.id), text.into_bytes(), TEXT_PLAIN)
            .await
    }

    /// Store clip number `index` of a session, replacing any earlier
    /// upload at the same index.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    pub async fn upload_video(
        &self,
        id: &SessionId,
        index: usize,
        bytes: Vec<u8>,
    ) -> RemoteResult<String> {
        let size = bytes.len();
        let url = self
            .objects
            .put(&Self::video_path(id, index), bytes, VIDEO_MP4)
            .await?;
        info!(session_id = %id, index, size, "Video clip stored");
        Ok(url)
    }
}

#[async_trait]
impl ExportUploader for ArtifactStore {
    async fn upload(&self, export: &PendingExport) -> RemoteResult<()> {
        self.upload_export(&export.session).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_paths() {
        let id = SessionId::new("1736912400000");
        assert_eq!(ArtifactStore::export_path(&id), "sessions/1736912400000/export.txt");
        assert_eq!(
            ArtifactStore::video_path(&id, 2),
            "sessions/1736912400000/videos/video_2.mp4"
        );
    }

    #[tokio::test]
    async fn test_fs_store_writes_export() {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(Arc::new(FsObjectStore::new(dir.path())));
        let session = Session::new(SessionId::new("42"), Role::Driver, Utc::now());

        let url = artifacts.upload_export(&session).await.unwrap();
        assert!(url.starts_with("file://"));

        let written = std::fs::read_to_string(dir.path().join("sessions/42/export.txt")).unwrap();
        let document: ExportDocument = serde_json::from_str(&written).unwrap();
        assert_eq!(document.sessions, vec![session]);
    }

    #[tokio::test]
    async fn test_upload_video_replaces_same_index() {
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(Arc::new(FsObjectStore::new(dir.path())));
        let id = SessionId::new("7");

        artifacts.upload_video(&id, 1, b"first".to_vec()).await.unwrap();
        let url = artifacts.upload_video(&id, 1, b"second".to_vec()).await.unwrap();

        assert!(url.ends_with("video_1.mp4"));
        assert_eq!(
            std::fs::read(dir.path().join("sessions/7/videos/video_1.mp4")).unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn test_fs_store_rejects_bad_path() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store.put("sessions/../x", Vec::new(), TEXT_PLAIN).await.unwrap_err();
        assert!(matches!(err, RemoteError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_unreachable_http_store_is_upload_error() {
        let store = HttpObjectStore::new("http://127.0.0.1:9", None, HttpTimeouts::default()).unwrap();
        let err = store.put("sessions/1/export.txt", Vec::new(), TEXT_PLAIN).await.unwrap_err();
        assert!(matches!(err, RemoteError::Upload { .. }));
        assert!(err.is_transient());
    }
}
