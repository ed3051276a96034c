//! WebSocket bridge — core message router.
//!
//! Routes NDJSON messages between one subprocess socket and zero-or-many
//! browser sockets per session. Owns the session records: state, typed
//! history, pending permissions, and the queue of frames awaiting a
//! subprocess that has not yet attached. Every history append and state
//! change is handed to the store before the routing call returns.

use super::external::ExternalHandler;
use super::launcher::CliLauncher;
use super::ndjson::encode_frame;
use super::types::{
    get_either, now_millis, HistoryEntry, PendingPermission, Session, SessionState,
};
use crate::core::naming::SessionNamer;
use crate::core::storage::SessionStore;
use crate::core::webhook::WebhookNotifier;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Everything a freshly attached browser needs before it sees live traffic.
pub struct ClientSnapshot {
    pub state: SessionState,
    pub history: Vec<HistoryEntry>,
    pub pending_permissions: Vec<PendingPermission>,
    pub cli_connected: bool,
    pub has_external_handler: bool,
}

/// The central router. One per server.
pub struct WsBridge {
    sessions: RwLock<HashMap<String, Session>>,
    handlers: RwLock<HashMap<String, Arc<dyn ExternalHandler>>>,
    store: Arc<dyn SessionStore>,
    launcher: Arc<CliLauncher>,
    webhook: Option<Arc<WebhookNotifier>>,
    namer: Option<Arc<dyn SessionNamer>>,
}

impl WsBridge {
    pub fn new(store: Arc<dyn SessionStore>, launcher: Arc<CliLauncher>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            store,
            launcher,
            webhook: None,
            namer: None,
        }
    }

    pub fn with_webhook(mut self, webhook: Arc<WebhookNotifier>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn with_namer(mut self, namer: Arc<dyn SessionNamer>) -> Self {
        self.namer = Some(namer);
        self
    }

    /// Get-or-create the session record and return its state.
    pub async fn create_session(&self, session_id: &str) -> SessionState {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id.to_string()))
            .state
            .clone()
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.state.clone())
    }

    pub async fn history(&self, session_id: &str) -> Vec<HistoryEntry> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub async fn pending_permission_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.pending_permissions.len())
            .unwrap_or(0)
    }

    /// Attach the subprocess socket: bind it, tell the browsers, flush the
    /// queued frames in order, then notify the launcher.
    pub async fn register_cli(&self, session_id: &str, tx: mpsc::Sender<String>) {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Session::new(session_id.to_string()));

            // The latest attach supersedes any previous socket.
            session.cli_tx = Some(tx);

            let connected = json!({"type": "cli_connected"});
            broadcast(&mut session.client_senders, &encode_frame(&connected)).await;

            let queued: Vec<String> = session.pending_messages.drain(..).collect();
            if !queued.is_empty() {
                info!(
                    "Flushing {} queued frames to subprocess for session {session_id}",
                    queued.len()
                );
                if let Some(cli_tx) = &session.cli_tx {
                    for frame in queued {
                        if cli_tx.send(frame).await.is_err() {
                            warn!("Queue flush failed for session {session_id}");
                            break;
                        }
                    }
                }
            }
        }
        self.launcher.mark_connected(session_id).await;
    }

    /// Detach the subprocess socket. A stale socket that was already
    /// superseded by a newer attach is ignored. Pending permissions are
    /// cancelled toward the browsers before the disconnect notice.
    pub async fn unregister_cli(&self, session_id: &str, tx: &mpsc::Sender<String>) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        let is_current = session
            .cli_tx
            .as_ref()
            .map(|t| t.same_channel(tx))
            .unwrap_or(false);
        if !is_current {
            debug!("Ignoring detach of superseded subprocess socket for {session_id}");
            return;
        }
        session.cli_tx = None;

        let cancelled: Vec<String> = session
            .pending_permissions
            .drain()
            .map(|(id, _)| id)
            .collect();
        for request_id in cancelled {
            let msg = json!({"type": "permission_cancelled", "request_id": request_id});
            broadcast(&mut session.client_senders, &encode_frame(&msg)).await;
        }

        let msg = json!({"type": "cli_disconnected"});
        broadcast(&mut session.client_senders, &encode_frame(&msg)).await;
    }

    /// Attach a browser socket and hand back the replay snapshot.
    pub async fn register_client(
        &self,
        session_id: &str,
        tx: mpsc::Sender<String>,
    ) -> ClientSnapshot {
        let has_external_handler = self.handlers.read().await.contains_key(session_id);
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id.to_string()));
        session.client_senders.push(tx);
        ClientSnapshot {
            state: session.state.clone(),
            history: session.history.clone(),
            pending_permissions: session.pending_permissions.values().cloned().collect(),
            cli_connected: session.cli_tx.is_some(),
            has_external_handler,
        }
    }

    pub async fn unregister_client(&self, session_id: &str, tx: &mpsc::Sender<String>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.client_senders.retain(|s| !s.same_channel(tx));
        }
    }

    /// Route one parsed NDJSON object from the subprocess to the browsers.
    pub async fn route_cli_message(&self, session_id: &str, json: Value) {
        let Some(msg_type) = json.get("type").and_then(|v| v.as_str()).map(String::from) else {
            warn!("Subprocess message without 'type' field: {json}");
            return;
        };

        let mut activity = false;
        let mut result_boundary = false;
        let mut webhook_text: Option<String> = None;

        {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                warn!("Subprocess message for unknown session {session_id}");
                return;
            };

            match msg_type.as_str() {
                "system" => {
                    let subtype = json.get("subtype").and_then(|v| v.as_str()).unwrap_or("");
                    match subtype {
                        "init" => {
                            session.state.update_from_init(&json);
                            debug!(
                                "Session {session_id} initialized: model={}, cwd={}",
                                session.state.model, session.state.cwd
                            );
                            let init = json!({
                                "type": "session_init",
                                "session": session.state,
                            });
                            broadcast(&mut session.client_senders, &encode_frame(&init)).await;
                            self.store.save_state(session_id, &session.state).await;
                        }
                        "status" => {
                            let status =
                                json.get("status").and_then(|v| v.as_str()).unwrap_or("");
                            session.state.is_compacting = status == "compacting";
                            if let Some(mode) =
                                get_either(&json, "permissionMode", "permission_mode")
                                    .and_then(|v| v.as_str())
                            {
                                session.state.permission_mode = mode.to_string();
                            }
                            let msg = json!({"type": "status_change", "status": status});
                            broadcast(&mut session.client_senders, &encode_frame(&msg)).await;
                        }
                        other => {
                            debug!("Ignoring system subtype '{other}' for {session_id}");
                        }
                    }
                }

                "assistant" => {
                    session.history.push(HistoryEntry::Assistant {
                        message: json.get("message").cloned().unwrap_or(Value::Null),
                        parent_tool_use_id: get_either(
                            &json,
                            "parent_tool_use_id",
                            "parentToolUseId",
                        )
                        .cloned()
                        .filter(|v| !v.is_null()),
                    });
                    broadcast(&mut session.client_senders, &encode_frame(&json)).await;
                    self.store.save_history(session_id, &session.history).await;
                    activity = true;
                }

                "result" => {
                    if let Some(cost) = get_either(&json, "total_cost_usd", "totalCostUsd")
                        .and_then(|v| v.as_f64())
                    {
                        session.state.total_cost_usd = cost;
                    }
                    if let Some(turns) =
                        get_either(&json, "num_turns", "numTurns").and_then(|v| v.as_u64())
                    {
                        session.state.num_turns = turns as u32;
                    }
                    if let Some(pct) = derive_context_used(&json) {
                        session.state.context_used_percent = pct;
                    }
                    session.history.push(HistoryEntry::Result { data: json.clone() });
                    broadcast(&mut session.client_senders, &encode_frame(&json)).await;
                    self.store.save_state(session_id, &session.state).await;
                    self.store.save_history(session_id, &session.history).await;

                    webhook_text = Some(
                        json.get("result")
                            .and_then(|v| v.as_str())
                            .unwrap_or("Waiting for input")
                            .to_string(),
                    );
                    result_boundary = true;
                    activity = true;
                }

                "stream_event" => {
                    // Stream deltas are forwarded, never persisted.
                    let msg = json!({
                        "type": "stream_event",
                        "event": json.get("event"),
                        "parentToolUseId": get_either(&json, "parent_tool_use_id", "parentToolUseId"),
                    });
                    broadcast(&mut session.client_senders, &encode_frame(&msg)).await;
                }

                "control_request" => {
                    let request_id = get_either(&json, "request_id", "requestId")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    let subtype = json
                        .get("request")
                        .and_then(|r| r.get("subtype"))
                        .and_then(|v| v.as_str());
                    if subtype == Some("can_use_tool") {
                        let request = &json["request"];
                        let pending = PendingPermission {
                            request_id: request_id.clone(),
                            tool_name: request
                                .get("tool_name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            input: request.get("input").cloned().unwrap_or_else(|| json!({})),
                            suggestions: get_either(
                                request,
                                "permission_suggestions",
                                "suggestions",
                            )
                            .cloned()
                            .filter(|v| !v.is_null()),
                            description: request
                                .get("description")
                                .and_then(|v| v.as_str())
                                .map(String::from),
                            tool_use_id: get_either(request, "tool_use_id", "toolUseId")
                                .and_then(|v| v.as_str())
                                .map(String::from),
                            agent_id: get_either(request, "agent_id", "agentId")
                                .and_then(|v| v.as_str())
                                .map(String::from),
                            timestamp: now_millis(),
                        };
                        session
                            .pending_permissions
                            .insert(request_id, pending.clone());
                        let msg = json!({"type": "permission_request", "request": pending});
                        broadcast(&mut session.client_senders, &encode_frame(&msg)).await;
                    } else {
                        debug!(
                            "Ignoring control_request subtype {subtype:?} for {session_id}"
                        );
                    }
                }

                "tool_progress" | "tool_use_summary" | "auth_status" => {
                    broadcast(&mut session.client_senders, &encode_frame(&json)).await;
                }

                "keep_alive" => {}

                other => {
                    debug!("Dropping unknown subprocess message type '{other}'");
                }
            }
        }

        if activity {
            self.launcher.mark_activity(session_id).await;
        }
        if result_boundary {
            self.launcher.mark_connected(session_id).await;
        }
        if let (Some(text), Some(webhook)) = (webhook_text, self.webhook.clone()) {
            let session_name = self
                .launcher
                .get_session(session_id)
                .await
                .and_then(|r| r.session_name);
            let id = session_id.to_string();
            tokio::spawn(async move {
                webhook
                    .notify_waiting(&id, session_name.as_deref(), &text, None)
                    .await;
            });
        }
    }

    /// Route one message from a browser toward the subprocess (or the
    /// session's external handler, which takes precedence).
    pub async fn route_client_message(&self, session_id: &str, json: Value) {
        let Some(msg_type) = json.get("type").and_then(|v| v.as_str()).map(String::from) else {
            warn!("Browser message without 'type' field: {json}");
            return;
        };

        let handler = self.handlers.read().await.get(session_id).cloned();
        let mut deliver_to_handler = false;
        let mut first_message: Option<String> = None;
        let mut mark_running = false;

        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Session::new(session_id.to_string()));

            match msg_type.as_str() {
                "user_message" => {
                    if session.state.archived {
                        let msg = json!({
                            "type": "error",
                            "error": "Session is archived",
                            "session_id": session_id,
                        });
                        broadcast(&mut session.client_senders, &encode_frame(&msg)).await;
                        return;
                    }

                    let content = json
                        .get("content")
                        .cloned()
                        .unwrap_or_else(|| Value::String(String::new()));
                    session.history.push(HistoryEntry::UserMessage {
                        content: content.clone(),
                        timestamp: now_millis(),
                    });
                    self.store.save_history(session_id, &session.history).await;

                    if !session.first_message_received {
                        session.first_message_received = true;
                        first_message = message_text(&content);
                    }
                    mark_running = true;

                    if handler.is_some() {
                        deliver_to_handler = true;
                    } else {
                        let frame = build_user_frame(&json, content, &session.state);
                        send_to_cli(session, &encode_frame(&frame)).await;
                    }
                }

                "permission_response" => {
                    let request_id = get_either(&json, "request_id", "requestId")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    let was_pending = session.pending_permissions.remove(&request_id).is_some();

                    if handler.is_some() {
                        deliver_to_handler = true;
                    } else if was_pending {
                        let response = build_permission_response(&json, &request_id);
                        send_to_cli(session, &encode_frame(&response)).await;
                    } else {
                        debug!(
                            "Dropping permission_response for unknown request {request_id}"
                        );
                    }
                }

                "interrupt" => {
                    if handler.is_some() {
                        deliver_to_handler = true;
                    } else {
                        let msg = json!({
                            "type": "control_request",
                            "request_id": uuid::Uuid::new_v4().to_string(),
                            "request": {"subtype": "interrupt"},
                        });
                        send_to_cli(session, &encode_frame(&msg)).await;
                    }
                }

                "set_model" => {
                    if handler.is_some() {
                        deliver_to_handler = true;
                    } else {
                        let model = json
                            .get("model")
                            .and_then(|v| v.as_str())
                            .unwrap_or("default");
                        let msg = json!({
                            "type": "control_request",
                            "request_id": uuid::Uuid::new_v4().to_string(),
                            "request": {"subtype": "set_model", "model": model},
                        });
                        send_to_cli(session, &encode_frame(&msg)).await;
                    }
                }

                "set_permission_mode" => {
                    if handler.is_some() {
                        deliver_to_handler = true;
                    } else {
                        let mode = json
                            .get("mode")
                            .and_then(|v| v.as_str())
                            .unwrap_or("default");
                        let msg = json!({
                            "type": "control_request",
                            "request_id": uuid::Uuid::new_v4().to_string(),
                            "request": {"subtype": "set_permission_mode", "mode": mode},
                        });
                        send_to_cli(session, &encode_frame(&msg)).await;
                    }
                }

                other => {
                    warn!("Unknown browser message type: {other}");
                }
            }
        }

        if mark_running {
            self.launcher.mark_running(session_id).await;
            self.launcher.mark_activity(session_id).await;
        }

        if let (Some(content), Some(namer)) = (first_message, self.namer.clone()) {
            let launcher = self.launcher.clone();
            let id = session_id.to_string();
            tokio::spawn(async move {
                let unnamed = launcher
                    .get_session(&id)
                    .await
                    .map(|r| r.session_name.is_none())
                    .unwrap_or(false);
                if unnamed {
                    if let Some(name) = namer.name_session(&content).await {
                        launcher.set_session_name(&id, &name).await;
                    }
                }
            });
        }

        if deliver_to_handler {
            if let Some(handler) = handler {
                handler.handle_browser_message(session_id, json).await;
            }
        }
    }

    /// Register an external handler; it replaces the subprocess path for
    /// this session until unregistered.
    pub async fn register_external_handler(
        &self,
        session_id: &str,
        handler: Arc<dyn ExternalHandler>,
    ) {
        self.handlers
            .write()
            .await
            .insert(session_id.to_string(), handler);
    }

    pub async fn unregister_external_handler(&self, session_id: &str) {
        self.handlers.write().await.remove(session_id);
    }

    /// Feed a browser-directed message from an external handler: appended to
    /// history when it is a conversation entry, then fanned out.
    pub async fn inject_to_browsers(&self, session_id: &str, message: Value) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id.to_string()));

        let mut persist = false;
        match message.get("type").and_then(|v| v.as_str()) {
            Some("user_message") => {
                session.history.push(HistoryEntry::UserMessage {
                    content: message
                        .get("content")
                        .cloned()
                        .unwrap_or_else(|| Value::String(String::new())),
                    timestamp: now_millis(),
                });
                persist = true;
            }
            Some("assistant") => {
                session.history.push(HistoryEntry::Assistant {
                    message: message.get("message").cloned().unwrap_or(Value::Null),
                    parent_tool_use_id: get_either(
                        &message,
                        "parent_tool_use_id",
                        "parentToolUseId",
                    )
                    .cloned()
                    .filter(|v| !v.is_null()),
                });
                persist = true;
            }
            Some("result") => {
                session
                    .history
                    .push(HistoryEntry::Result {
                        data: message.clone(),
                    });
                persist = true;
            }
            _ => {}
        }
        if persist {
            self.store.save_history(session_id, &session.history).await;
        }
        broadcast(&mut session.client_senders, &encode_frame(&message)).await;
    }

    /// Rebuild a session record without sockets — startup recovery path.
    pub async fn restore_session(
        &self,
        session_id: &str,
        mut state: SessionState,
        history: Vec<HistoryEntry>,
        archived: bool,
    ) {
        state.archived = archived;
        let first_message_received = history.iter().any(HistoryEntry::is_user_message);
        let session = Session {
            id: session_id.to_string(),
            cli_tx: None,
            client_senders: Vec::new(),
            state,
            pending_permissions: HashMap::new(),
            pending_messages: Vec::new(),
            history,
            first_message_received,
        };
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), session);
    }

    /// The session's subprocess is gone for good; refuse further input.
    pub async fn mark_archived(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.state.archived = true;
            self.store.save_state(session_id, &session.state).await;
        }
    }

    /// Drop the in-memory record. Dropping the senders ends the per-socket
    /// write pumps; persisted data stays.
    pub async fn close_session(&self, session_id: &str) -> bool {
        self.handlers.write().await.remove(session_id);
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Drop the record and delete the persisted directory.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let existed = self.close_session(session_id).await;
        self.store.remove(session_id).await;
        existed
    }
}

/// Fan one serialized frame out to every browser sender, dropping senders
/// whose receiving pump has gone away.
async fn broadcast(senders: &mut Vec<mpsc::Sender<String>>, message: &str) {
    let mut failed: Vec<usize> = Vec::new();
    for (i, sender) in senders.iter().enumerate() {
        if sender.send(message.to_string()).await.is_err() {
            failed.push(i);
        }
    }
    for i in failed.into_iter().rev() {
        senders.remove(i);
        debug!("Removed closed browser sender");
    }
}

/// Send toward the subprocess, or queue while no socket is attached.
async fn send_to_cli(session: &mut Session, message: &str) {
    if let Some(cli_tx) = &session.cli_tx {
        if cli_tx.send(message.to_string()).await.is_err() {
            warn!("Failed to send to subprocess for session {}", session.id);
        }
    } else {
        debug!(
            "Subprocess not attached for session {}, queuing frame",
            session.id
        );
        session.pending_messages.push(message.to_string());
    }
}

/// Build the subprocess-bound user frame. Images become a content block
/// array with the text appended last.
fn build_user_frame(json: &Value, content: Value, state: &SessionState) -> Value {
    let message_content = match json.get("images").and_then(|v| v.as_array()) {
        Some(images) if !images.is_empty() => {
            let mut blocks: Vec<Value> = images
                .iter()
                .map(|img| {
                    json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": get_either(img, "media_type", "mediaType")
                                .cloned()
                                .unwrap_or_else(|| json!("image/png")),
                            "data": img.get("data").cloned().unwrap_or_else(|| json!("")),
                        },
                    })
                })
                .collect();
            blocks.push(json!({"type": "text", "text": content}));
            Value::Array(blocks)
        }
        _ => content,
    };

    json!({
        "type": "user",
        "message": {"role": "user", "content": message_content},
        "parent_tool_use_id": null,
        "session_id": state.cli_session_id.clone().unwrap_or_default(),
    })
}

fn build_permission_response(json: &Value, request_id: &str) -> Value {
    let behavior = json.get("behavior").and_then(|v| v.as_str()).unwrap_or("deny");
    let response_payload = if behavior == "allow" {
        let mut payload = json!({
            "behavior": "allow",
            "updatedInput": get_either(json, "updated_input", "updatedInput")
                .cloned()
                .unwrap_or_else(|| json!({})),
        });
        if let Some(perms) = get_either(json, "updated_permissions", "updatedPermissions") {
            if !perms.is_null() {
                payload["updatedPermissions"] = perms.clone();
            }
        }
        payload
    } else {
        json!({
            "behavior": "deny",
            "message": json
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("Permission denied by user"),
        })
    };

    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response_payload,
        },
    })
}

/// Context share reported directly, or derived from per-model usage.
fn derive_context_used(json: &Value) -> Option<u8> {
    if let Some(pct) =
        get_either(json, "contextUsedPercent", "context_used_percent").and_then(|v| v.as_u64())
    {
        return Some(pct.min(100) as u8);
    }
    let usage = get_either(json, "modelUsage", "model_usage")?.as_object()?;
    for entry in usage.values() {
        let window = get_either(entry, "contextWindow", "context_window")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        if window > 0.0 {
            let input = get_either(entry, "inputTokens", "input_tokens")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let output = get_either(entry, "outputTokens", "output_tokens")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let pct = ((input + output) / window * 100.0).round();
            return Some(pct.clamp(0.0, 100.0) as u8);
        }
    }
    None
}

/// Best-effort plain text of a user message, for the naming hook.
fn message_text(content: &Value) -> Option<String> {
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    content.as_array()?.iter().find_map(|block| {
        if block.get("type").and_then(|v| v.as_str()) == Some("text") {
            block.get("text").and_then(|v| v.as_str()).map(String::from)
        } else {
            None
        }
    })
}
