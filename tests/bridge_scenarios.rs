//! End-to-end flows across bridge, launcher, store, and recovery, using a
//! real file-backed store in a temp directory and channel-backed sockets.

use agent_bridge::core::recovery;
use agent_bridge::core::storage::{FileSessionStore, SessionStore};
use agent_bridge::ws::bridge::WsBridge;
use agent_bridge::ws::launcher::{CliLauncher, LaunchState, LauncherConfig};
use agent_bridge::ws::types::{Provider, SessionMeta, SessionState};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn stack(dir: &Path) -> (Arc<dyn SessionStore>, Arc<CliLauncher>, Arc<WsBridge>) {
    let store: Arc<dyn SessionStore> = FileSessionStore::new(dir);
    let (launcher, _exit_rx) = CliLauncher::new(
        LauncherConfig {
            binary: "definitely-not-a-real-binary".to_string(),
            port: 9,
            tls: false,
            self_signed: false,
            default_cwd: Some(std::env::temp_dir()),
        },
        store.clone(),
    );
    let launcher = Arc::new(launcher);
    let bridge = Arc::new(WsBridge::new(store.clone(), launcher.clone()));
    (store, launcher, bridge)
}

async fn next_json(rx: &mut mpsc::Receiver<String>) -> Value {
    let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed");
    serde_json::from_str(raw.trim()).unwrap()
}

fn meta(id: &str, pid: Option<u32>) -> SessionMeta {
    SessionMeta {
        id: id.to_string(),
        pid,
        model: Some("m1".to_string()),
        permission_mode: Some("default".to_string()),
        provider: Provider::Claude,
        cwd: "/w".to_string(),
        created_at: Utc::now(),
        session_name: Some("recovered session".to_string()),
        last_activity_at: None,
    }
}

#[tokio::test]
async fn basic_round_trip_with_durable_history() {
    let dir = TempDir::new().unwrap();
    let (store, _launcher, bridge) = stack(dir.path());
    let session_id = uuid::Uuid::new_v4().to_string();

    // Persist an identity for the session like the launcher would.
    store.save_meta(&session_id, &meta(&session_id, None)).await;
    bridge.create_session(&session_id).await;

    let (browser_tx, mut browser_rx) = mpsc::channel(64);
    bridge.register_client(&session_id, browser_tx).await;
    let (cli_tx, mut cli_rx) = mpsc::channel(64);
    bridge.register_cli(&session_id, cli_tx).await;
    assert_eq!(next_json(&mut browser_rx).await["type"], "cli_connected");

    bridge
        .route_cli_message(
            &session_id,
            json!({
                "type": "system", "subtype": "init",
                "model": "m1", "cwd": "/w", "tools": ["R"],
                "permissionMode": "default", "version": "1",
            }),
        )
        .await;
    let init = next_json(&mut browser_rx).await;
    assert_eq!(init["type"], "session_init");
    assert_eq!(init["session"]["id"], session_id);
    assert_eq!(init["session"]["model"], "m1");

    bridge
        .route_client_message(
            &session_id,
            json!({"type": "user_message", "content": "hi"}),
        )
        .await;
    let user_frame = next_json(&mut cli_rx).await;
    assert_eq!(user_frame["type"], "user");
    assert_eq!(user_frame["message"]["role"], "user");
    assert_eq!(user_frame["message"]["content"], "hi");
    assert!(user_frame["parent_tool_use_id"].is_null());
    assert_eq!(user_frame["session_id"], "");

    let assistant = json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": "hello"}]},
    });
    bridge.route_cli_message(&session_id, assistant.clone()).await;
    let forwarded = next_json(&mut browser_rx).await;
    assert_eq!(forwarded, assistant);

    // Every broadcast conversation entry is durable after a flush.
    store.flush().await;
    let persisted = store.load(&session_id).await.unwrap();
    assert_eq!(persisted.history.len(), 2);
    assert!(persisted.history[0].is_user_message());
    let entry = serde_json::to_value(&persisted.history[1]).unwrap();
    assert_eq!(entry["type"], "assistant");
    assert_eq!(entry["message"]["content"][0]["text"], "hello");
}

#[tokio::test]
async fn stream_events_stay_out_of_the_store() {
    let dir = TempDir::new().unwrap();
    let (store, _launcher, bridge) = stack(dir.path());
    let session_id = uuid::Uuid::new_v4().to_string();
    store.save_meta(&session_id, &meta(&session_id, None)).await;
    bridge.create_session(&session_id).await;

    for i in 0..5 {
        bridge
            .route_cli_message(
                &session_id,
                json!({"type": "stream_event", "event": {"delta": i}}),
            )
            .await;
    }
    bridge
        .route_cli_message(&session_id, json!({"type": "assistant", "message": {}}))
        .await;

    store.flush().await;
    let persisted = store.load(&session_id).await.unwrap();
    assert_eq!(persisted.history.len(), 1);
    assert!(!persisted.history[0].is_user_message());
}

#[cfg(unix)]
#[tokio::test]
async fn restart_recovery_classifies_live_sessions() {
    let dir = TempDir::new().unwrap();
    let session_id = uuid::Uuid::new_v4().to_string();

    // First server lifetime: a session whose pid is definitely alive (ours).
    {
        let (store, _launcher, bridge) = stack(dir.path());
        store
            .save_meta(&session_id, &meta(&session_id, Some(std::process::id())))
            .await;
        let mut state = SessionState::new(session_id.clone());
        state.model = "m1".to_string();
        store.save_state(&session_id, &state).await;
        bridge.create_session(&session_id).await;
        bridge
            .route_client_message(
                &session_id,
                json!({"type": "user_message", "content": "before restart"}),
            )
            .await;
        store.flush().await;
    }

    // Second lifetime: recover and attach a browser.
    let (store, launcher, bridge) = stack(dir.path());
    let live = recovery::recover_sessions(&store, &launcher, &bridge).await;
    assert_eq!(live, 1);

    let record = launcher.get_session(&session_id).await.unwrap();
    assert_eq!(record.state, LaunchState::Connected);
    assert!(!record.archived);

    let (tx, _rx) = mpsc::channel(64);
    let snapshot = bridge.register_client(&session_id, tx).await;
    assert!(!snapshot.state.archived);
    assert_eq!(snapshot.state.model, "m1");
    assert_eq!(snapshot.history.len(), 1);
    assert!(snapshot.history[0].is_user_message());
}

#[cfg(unix)]
#[tokio::test]
async fn restart_recovery_archives_dead_sessions() {
    let dir = TempDir::new().unwrap();
    let session_id = uuid::Uuid::new_v4().to_string();

    {
        let (store, _launcher, _bridge) = stack(dir.path());
        store
            .save_meta(&session_id, &meta(&session_id, Some(u32::MAX - 1)))
            .await;
        store
            .save_state(&session_id, &SessionState::new(session_id.clone()))
            .await;
        store.flush().await;
    }

    let (store, launcher, bridge) = stack(dir.path());
    recovery::recover_sessions(&store, &launcher, &bridge).await;

    let record = launcher.get_session(&session_id).await.unwrap();
    assert_eq!(record.state, LaunchState::Exited);
    assert_eq!(record.exit_code, Some(-1));
    assert!(record.archived);

    let (tx, mut rx) = mpsc::channel(64);
    let snapshot = bridge.register_client(&session_id, tx).await;
    assert!(snapshot.state.archived);
    assert!(!snapshot.cli_connected);

    // Writing into the archived session only yields an error broadcast.
    bridge
        .route_client_message(
            &session_id,
            json!({"type": "user_message", "content": "anyone home?"}),
        )
        .await;
    let err = next_json(&mut rx).await;
    assert_eq!(err["type"], "error");

    store.flush().await;
    assert!(store.load(&session_id).await.unwrap().history.is_empty());
}

#[tokio::test]
async fn restart_preserves_identity_and_history_order() {
    let dir = TempDir::new().unwrap();
    let session_id = uuid::Uuid::new_v4().to_string();
    let saved_meta = meta(&session_id, Some(777));

    {
        let (store, _launcher, bridge) = stack(dir.path());
        store.save_meta(&session_id, &saved_meta).await;
        bridge.create_session(&session_id).await;
        for i in 0..4 {
            bridge
                .route_client_message(
                    &session_id,
                    json!({"type": "user_message", "content": format!("msg {i}")}),
                )
                .await;
        }
        store.flush().await;
    }

    let (store, _launcher, _bridge) = stack(dir.path());
    let all = store.load_all().await;
    let persisted = all.iter().find(|p| p.meta.id == session_id).unwrap();
    assert_eq!(persisted.meta.pid, Some(777));
    assert_eq!(persisted.meta.cwd, saved_meta.cwd);
    assert_eq!(persisted.meta.session_name, saved_meta.session_name);
    assert_eq!(persisted.history.len(), 4);
    for (i, entry) in persisted.history.iter().enumerate() {
        let v = serde_json::to_value(entry).unwrap();
        assert_eq!(v["content"], format!("msg {i}"));
    }
}
