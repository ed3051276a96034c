//! REST endpoints for session management.
//!
//! Creation launches a subprocess and registers the bridge record; deletion
//! tears down launcher, bridge, and persisted data together.

use crate::core::storage::SessionStore;
use crate::ws::bridge::WsBridge;
use crate::ws::launcher::{CliLauncher, LaunchOptions};
use crate::ws::types::{CreateSessionRequest, CreateSessionResponse, RenameSessionRequest};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct SessionsState {
    pub bridge: Arc<WsBridge>,
    pub launcher: Arc<CliLauncher>,
    pub store: Arc<dyn SessionStore>,
}

pub fn router(state: SessionsState) -> Router {
    Router::new()
        .route("/sessions/create", post(create_session))
        .route("/sessions", get(list_sessions))
        .route("/sessions/prune", post(prune_sessions))
        .route("/sessions/kill-all", post(kill_all_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/kill", post(kill_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/name", patch(rename_session))
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Session not found: {id}")})),
    )
}

/// POST /sessions/create — launch a subprocess and register the session.
async fn create_session(
    State(state): State<SessionsState>,
    Json(req): Json<CreateSessionRequest>,
) -> (StatusCode, Json<CreateSessionResponse>) {
    let record = state
        .launcher
        .launch(LaunchOptions {
            model: req.model,
            permission_mode: req.permission_mode,
            provider: req.provider,
            cwd: req.cwd,
            binary_override: req.binary_override,
            allowed_tools: req.allowed_tools,
            env: req.env,
            ..Default::default()
        })
        .await;

    let session_state = state.bridge.create_session(&record.id).await;
    info!("Created session {}", record.id);

    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            ws_url: format!("/ws/browser/{}", record.id),
            model: record.model.clone(),
            cwd: record.cwd.clone(),
            session_id: record.id,
            state: session_state,
        }),
    )
}

/// GET /sessions — every launcher record.
async fn list_sessions(State(state): State<SessionsState>) -> Json<Value> {
    let sessions = state.launcher.list_sessions().await;
    Json(json!({"sessions": sessions}))
}

/// GET /sessions/:id — one record or 404.
async fn get_session(
    State(state): State<SessionsState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.launcher.get_session(&id).await {
        Some(record) => Ok(Json(json!(record))),
        None => Err(not_found(&id)),
    }
}

/// POST /sessions/:id/kill — graceful termination, record kept.
async fn kill_session(
    State(state): State<SessionsState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.launcher.kill(&id).await {
        Ok(Json(json!({"killed": true, "sessionId": id})))
    } else {
        Err(not_found(&id))
    }
}

/// DELETE /sessions/:id — kill and remove from launcher, bridge, and store.
async fn delete_session(
    State(state): State<SessionsState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.launcher.kill(&id).await;
    let in_launcher = state.launcher.remove_session(&id).await;
    let in_bridge = state.bridge.remove_session(&id).await;
    if in_launcher || in_bridge {
        info!("Deleted session {id}");
        Ok(Json(json!({"deleted": true, "sessionId": id})))
    } else {
        Err(not_found(&id))
    }
}

/// POST /sessions/:id/resume — launch a new session that resumes an
/// archived one via its upstream session id. A session that never received
/// an upstream id (no `system`/`init` arrived) starts fresh instead; the
/// response says which happened via `resumed`.
async fn resume_session(
    State(state): State<SessionsState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    // Prefer the in-memory state; fall back to disk for sessions that were
    // never recovered into the bridge.
    let resume_id = match state.bridge.session_state(&id).await {
        Some(s) => s.cli_session_id,
        None => match state.store.load(&id).await {
            Some(persisted) => persisted.state.cli_session_id,
            None => return Err(not_found(&id)),
        },
    };
    let resumed = resume_id.is_some();

    let previous = state.launcher.get_session(&id).await;
    let record = state
        .launcher
        .launch(LaunchOptions {
            model: previous.as_ref().and_then(|r| r.model.clone()),
            permission_mode: previous.as_ref().and_then(|r| r.permission_mode.clone()),
            cwd: previous.as_ref().map(|r| r.cwd.clone()),
            session_name: previous.as_ref().and_then(|r| r.session_name.clone()),
            resume_id,
            ..Default::default()
        })
        .await;

    let session_state = state.bridge.create_session(&record.id).await;
    if resumed {
        info!("Resumed session {id} as {}", record.id);
    } else {
        warn!(
            "Session {id} has no upstream id to resume, started {} fresh",
            record.id
        );
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sessionId": record.id,
            "wsUrl": format!("/ws/browser/{}", record.id),
            "model": record.model,
            "cwd": record.cwd,
            "state": session_state,
            "resumed": resumed,
        })),
    ))
}

/// POST /sessions/prune — drop every exited session, including its bridge
/// record and persisted data.
async fn prune_sessions(State(state): State<SessionsState>) -> Json<Value> {
    let ids = state.launcher.prune_exited().await;
    for id in &ids {
        state.bridge.remove_session(id).await;
    }
    if !ids.is_empty() {
        info!("Pruned {} exited sessions", ids.len());
    }
    Json(json!({"pruned": ids.len(), "sessionIds": ids}))
}

/// POST /sessions/kill-all — gracefully terminate every child this runtime
/// owns. Records stay archived for history viewing.
async fn kill_all_sessions(State(state): State<SessionsState>) -> Json<Value> {
    let killed = state.launcher.kill_all().await;
    info!("Kill-all signalled {killed} sessions");
    Json(json!({"killed": killed}))
}

/// PATCH /sessions/:id/name — update the persisted session name.
async fn rename_session(
    State(state): State<SessionsState>,
    Path(id): Path<String>,
    Json(req): Json<RenameSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    if state.launcher.set_session_name(&id, &req.name).await {
        Ok(Json(json!({"sessionId": id, "sessionName": req.name})))
    } else {
        Err(not_found(&id))
    }
}
