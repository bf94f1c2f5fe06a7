//! End-to-end tests for the HTTP API over in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum_test::TestServer;
use convoy_core::config::StorageConfig;
use convoy_core::{
    Config, FsObjectStore, MemoryRemoteStore, MockTransport, RemoteStore, Role, SessionStore,
};
use convoy_server::api::create_router;
use convoy_server::state::AppState;
use serde_json::{json, Value};
use tempfile::TempDir;

struct Device {
    dir: TempDir,
    state: AppState,
    server: TestServer,
}

fn device(role: Role, remote: &Arc<MemoryRemoteStore>) -> Device {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.device.role = role;
    config.storage = StorageConfig {
        data_dir: Some(dir.path().join("data")),
    };
    config.transport.auto_connect = false;

    let store = SessionStore::open_shared(dir.path().join("data")).unwrap();
    let remote: Arc<dyn RemoteStore> = remote.clone();
    let objects = Arc::new(FsObjectStore::new(dir.path().join("objects")));
    let transport = Arc::new(MockTransport::new(Duration::ZERO));

    let state = AppState::from_parts(config, store, remote, objects, transport, None);
    let server = TestServer::new(create_router(state.clone())).unwrap();
    Device {
        dir,
        state,
        server,
    }
}

async fn connected_driver(remote: &Arc<MemoryRemoteStore>) -> Device {
    let driver = device(Role::Driver, remote);
    driver
        .server
        .post("/api/devices/connect")
        .json(&json!({}))
        .await
        .assert_status_ok();
    driver
}

async fn start(driver: &Device) -> String {
    let response = driver.server.post("/api/session/start").await;
    response.assert_status(StatusCode::CREATED);
    let session: Value = response.json();
    session["id"].as_str().unwrap().to_string()
}

fn fix() -> Value {
    json!({"latitude": 48.8566, "longitude": 2.3522, "accuracy": 8.0})
}

#[tokio::test]
async fn test_health_reports_role() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let validator = device(Role::Validator, &remote);

    let response = validator.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["role"], "validator");
}

#[tokio::test]
async fn test_driver_cannot_start_without_companion() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = device(Role::Driver, &remote);

    let response = driver.server.post("/api/session/start").await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"], "device_not_connected");

    driver
        .server
        .post("/api/devices/connect")
        .json(&json!({"device_id": "MOCK_DEVICE_001"}))
        .await
        .assert_status_ok();
    start(&driver).await;
}

#[tokio::test]
async fn test_validator_cannot_start() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let validator = device(Role::Validator, &remote);

    let response = validator.server.post("/api/session/start").await;
    response.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_start_and_end_session() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    let id = start(&driver).await;

    let state: Value = driver.server.get("/api/session/state").await.json();
    assert_eq!(state["coordinator"]["state"], "active");
    assert_eq!(state["coordinator"]["sessionId"], id);

    driver
        .server
        .post("/api/session/start")
        .await
        .assert_status(StatusCode::CONFLICT);

    let response = driver.server.post("/api/session/end").await;
    response.assert_status_ok();
    let ended: Value = response.json();
    assert_eq!(ended["ended"], true);
    assert_eq!(ended["session"]["id"], id);
    assert_eq!(ended["session"]["status"], "completed");
    assert_eq!(ended["export"], "uploaded");

    let again: Value = driver.server.post("/api/session/end").await.json();
    assert_eq!(again["ended"], false);

    let current: Value = driver.server.get("/api/session").await.json();
    assert!(current["session"].is_null());
}

#[tokio::test]
async fn test_record_event_requires_location_fix() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    let id = start(&driver).await;

    let response = driver
        .server
        .post("/api/events")
        .json(&json!({"session_id": id, "kind": "FAUX_POSITIF", "location": null}))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"], "no_location_fix");

    let current: Value = driver.server.get("/api/session").await.json();
    assert_eq!(current["session"]["events"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_record_event_and_location() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    let id = start(&driver).await;

    driver
        .server
        .post("/api/events")
        .json(&json!({
            "session_id": id,
            "kind": "DANGER_NON_DETECTE",
            "location": fix(),
            "speed": 12.0,
            "notes": "crossing"
        }))
        .await
        .assert_status(StatusCode::CREATED);

    let response = driver
        .server
        .post("/api/locations")
        .json(&json!({"session_id": id, "location": fix(), "speed": 13.9, "altitude": 35.0}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let sample: Value = response.json();
    assert_eq!(sample["deviceConnected"], true);

    let current: Value = driver.server.get("/api/session").await.json();
    assert_eq!(current["session"]["events"][0]["notes"], "crossing");
    assert_eq!(current["session"]["locationData"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_event_for_other_session_is_rejected() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    start(&driver).await;

    let response = driver
        .server
        .post("/api/events")
        .json(&json!({"session_id": "42", "kind": "FAUX_POSITIF", "location": fix()}))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"], "session_mismatch");

    let response = driver
        .server
        .post("/api/events")
        .json(&json!({"session_id": "", "kind": "FAUX_POSITIF", "location": fix()}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_validator_join_and_leave() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    let validator = device(Role::Validator, &remote);
    let id = start(&driver).await;

    let response = validator
        .server
        .post("/api/session/join")
        .json(&json!({"session_id": id}))
        .await;
    response.assert_status_ok();
    let state: Value = response.json();
    assert_eq!(state["coordinator"]["state"], "joined");
    assert_eq!(state["coordinator"]["sessionId"], id);

    validator
        .server
        .post("/api/events")
        .json(&json!({"session_id": id, "kind": "MOYEN_NON_DETECTE", "location": fix()}))
        .await
        .assert_status(StatusCode::CREATED);

    let response = validator.server.post("/api/session/leave").await;
    response.assert_status_ok();
    let left: Value = response.json();
    assert_eq!(left["left"], true);
    assert_eq!(left["session"]["id"], id);

    let state: Value = validator.server.get("/api/session/state").await.json();
    assert_eq!(state["coordinator"]["state"], "idle");

    driver
        .server
        .post("/api/session/join")
        .json(&json!({"session_id": id}))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    validator.state.shutdown().await;
    driver.state.shutdown().await;
}

#[tokio::test]
async fn test_nested_session_id_is_rejected() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let validator = device(Role::Validator, &remote);

    let response = validator
        .server
        .post("/api/session/join")
        .json(&json!({"session_id": "5/vehicles"}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_session_id");

    let response = validator
        .server
        .post("/api/locations")
        .json(&json!({"session_id": "5/vehicles", "location": fix()}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert!(remote.snapshot().is_null());
}

#[tokio::test]
async fn test_export_download_has_file_name() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    let id = start(&driver).await;
    driver.server.post("/api/session/end").await.assert_status_ok();

    let response = driver.server.get("/api/export").await;
    response.assert_status_ok();
    let disposition = response.header(header::CONTENT_DISPOSITION);
    let disposition = disposition.to_str().unwrap();
    assert!(disposition.contains("safety_validator_export_"));
    assert!(disposition.ends_with(".txt\""));
    assert!(response.text().contains(&id));

    let sessions: Value = driver.server.get("/api/sessions").await.json();
    assert_eq!(sessions["count"], 1);

    let remote_sessions: Value = driver.server.get("/api/sessions/remote").await.json();
    assert_eq!(remote_sessions["count"], 1);
    assert_eq!(remote_sessions["sessions"][0]["status"], "completed");
}

#[tokio::test]
async fn test_upload_video_clip() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    let id = start(&driver).await;

    let response = driver
        .server
        .put(&format!("/api/sessions/{id}/videos/0"))
        .content_type("video/mp4")
        .bytes(Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["session_id"], id);
    assert_eq!(body["index"], 0);

    let stored = driver
        .dir
        .path()
        .join(format!("objects/sessions/{id}/videos/video_0.mp4"));
    assert_eq!(std::fs::read(stored).unwrap(), b"\x00\x00\x00\x18ftypmp42");

    driver
        .server
        .put("/api/sessions/999/videos/0")
        .bytes(Bytes::from_static(b"clip"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    driver
        .server
        .put(&format!("/api/sessions/{id}/videos/1"))
        .bytes(Bytes::new())
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_uploads_queue_starts_empty() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let validator = device(Role::Validator, &remote);

    let pending: Value = validator.server.get("/api/uploads").await.json();
    assert_eq!(pending["count"], 0);

    let response = validator.server.post("/api/uploads/flush").await;
    response.assert_status_ok();
    let report: Value = response.json();
    assert_eq!(report["attempted"], 0);
}

#[tokio::test]
async fn test_clear_data_removes_local_sessions() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;
    start(&driver).await;

    let response = driver.server.delete("/api/data").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["cleared"], true);

    let sessions: Value = driver.server.get("/api/sessions").await.json();
    assert_eq!(sessions["count"], 0);
    let state: Value = driver.server.get("/api/session/state").await.json();
    assert_eq!(state["coordinator"]["state"], "idle");
}

#[tokio::test]
async fn test_scan_and_disconnect() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let driver = connected_driver(&remote).await;

    let scan: Value = driver.server.get("/api/devices").await.json();
    assert_eq!(scan["devices"][0]["id"], "MOCK_DEVICE_001");

    let response = driver.server.post("/api/devices/disconnect").await;
    response.assert_status_ok();
    assert!(!driver.state.transport().is_connected());
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let validator = device(Role::Validator, &remote);

    let doc: Value = validator.server.get("/api/openapi.json").await.json();
    assert_eq!(doc["info"]["title"], "convoy API");
    assert!(doc["paths"]["/api/session/join"].is_object());
}
