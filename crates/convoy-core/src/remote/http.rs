//! REST client for a Firebase-style realtime database.
//!
//! Every path maps to `{base_url}/{path}.json`:
//!
//! | operation | method |
//! |-----------|--------|
//! | set       | `PUT`  |
//! | update    | `PATCH`|
//! | push      | `POST` (answers `{"name": "<key>"}`) |
//! | get       | `GET` (answers `null` when absent) |
//!
//! Subscriptions poll `GET` and fire when the value changes.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    split_path, HttpTimeouts, Listener, RemoteError, RemoteResult, RemoteStore, Subscription,
};

/// Remote store backed by a REST endpoint.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

impl HttpRemoteStore {
    /// Create a client for the database at `base_url`.
    ///
    /// `auth_token` is sent as the `auth` query parameter when present.
    /// Every request, including subscription polls, is bounded by
    /// `timeouts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        poll_interval: Duration,
        timeouts: HttpTimeouts,
    ) -> RemoteResult<Self> {
        Ok(Self {
            client: timeouts.client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
            poll_interval,
        })
    }

    fn url(&self, path: &str) -> RemoteResult<String> {
        let segments = split_path(path)?;
        Ok(format!("{}/{}.json", self.base_url, segments.join("/")))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token)]),
            None => builder,
        }
    }

    async fn fetch(&self, url: &str) -> RemoteResult<Option<Value>> {
        let value: Value = self
            .request(reqwest::Method::GET, url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn set(&self, path: &str, value: Value) -> RemoteResult<()> {
        let url = self.url(path)?;
        debug!(path, "PUT remote value");
        self.request(reqwest::Method::PUT, &url)
            .json(&value)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> RemoteResult<()> {
        let url = self.url(path)?;
        debug!(path, fields = fields.len(), "PATCH remote value");
        self.request(reqwest::Method::PATCH, &url)
            .json(&fields)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> RemoteResult<String> {
        let url = self.url(path)?;
        debug!(path, "POST remote child");
        let response: PushResponse = self
            .request(reqwest::Method::POST, &url)
            .json(&value)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.name)
    }

    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        let url = self.url(path)?;
        self.fetch(&url).await
    }

    fn subscribe(&self, path: &str, listener: Listener) -> RemoteResult<Subscription> {
        let url = self.url(path)?;
        let store = self.clone();
        let path = path.to_string();
        let token = CancellationToken::new();
        let cancel = token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last: Option<Value> = None;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match store.fetch(&url).await {
                    Ok(current) if current != last => {
                        last.clone_from(&current);
                        if let Some(value) = current {
                            listener(value);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!(path = %path, error = %err, "Remote poll failed"),
                }
            }
            debug!(path = %path, "Remote subscription stopped");
        });

        Ok(Subscription::new(move || cancel.cancel()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn store(base_url: &str) -> HttpRemoteStore {
        HttpRemoteStore::new(base_url, None, Duration::from_secs(1), HttpTimeouts::default())
            .unwrap()
    }

    #[test]
    fn test_url_building() {
        let store = store("https://db.example.com/");
        assert_eq!(
            store.url("sessions/17/events").unwrap(),
            "https://db.example.com/sessions/17/events.json"
        );
        assert_eq!(store.url("/activeSession").unwrap(), "https://db.example.com/activeSession.json");
    }

    #[test]
    fn test_url_rejects_invalid_segments() {
        let store = store("https://db.example.com");
        assert!(matches!(store.url("sessions/a#b"), Err(RemoteError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let store = store("http://127.0.0.1:9");
        let err = store.get("activeSession").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let timeouts = HttpTimeouts {
            request: Duration::from_millis(300),
            connect: Duration::from_millis(300),
        };
        let store =
            HttpRemoteStore::new(format!("http://{addr}"), None, Duration::from_secs(1), timeouts)
                .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            store.push("sessions/1/events", serde_json::json!({"kind": "FAUX_POSITIF"})),
        )
        .await
        .expect("request deadline was not applied");
        assert!(result.unwrap_err().is_transient());
        accept.abort();
    }
}
