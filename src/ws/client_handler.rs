//! Browser WebSocket handler.
//!
//! Endpoint: `/ws/browser/:session_id`. On attach the browser receives the
//! full snapshot before any live traffic: `session_init`, then
//! `message_history`, then any pending permission requests, then
//! `cli_disconnected` when no subprocess (or external handler) is serving
//! the session.

use super::bridge::WsBridge;
use super::ndjson::{decode_frames, encode_frame};
use axum::{
    extract::{ws::Message as AxumWsMessage, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub async fn ws_browser_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(bridge): State<Arc<WsBridge>>,
) -> Response {
    if uuid::Uuid::parse_str(&session_id).is_err() {
        warn!("Rejected browser attach with malformed session id: {session_id}");
        return StatusCode::BAD_REQUEST.into_response();
    }
    info!("Browser WebSocket upgrade for session {session_id}");
    ws.on_upgrade(move |socket| handle_browser_socket(socket, session_id, bridge))
        .into_response()
}

async fn handle_browser_socket(
    socket: axum::extract::ws::WebSocket,
    session_id: String,
    bridge: Arc<WsBridge>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (client_tx, mut client_rx) = mpsc::channel::<String>(256);
    let snapshot = bridge.register_client(&session_id, client_tx.clone()).await;
    info!(
        "Browser connected to session {session_id} (history: {} msgs, pending perms: {})",
        snapshot.history.len(),
        snapshot.pending_permissions.len()
    );

    // The snapshot goes straight to the sink; live broadcasts accumulate in
    // the channel meanwhile and drain only after, preserving attach order.
    let init = json!({"type": "session_init", "session": snapshot.state});
    if ws_sink
        .send(AxumWsMessage::Text(encode_frame(&init)))
        .await
        .is_err()
    {
        bridge.unregister_client(&session_id, &client_tx).await;
        return;
    }

    if !snapshot.history.is_empty() {
        let history = json!({"type": "message_history", "messages": snapshot.history});
        if ws_sink
            .send(AxumWsMessage::Text(encode_frame(&history)))
            .await
            .is_err()
        {
            bridge.unregister_client(&session_id, &client_tx).await;
            return;
        }
    }

    for pending in &snapshot.pending_permissions {
        let msg = json!({"type": "permission_request", "request": pending});
        if ws_sink
            .send(AxumWsMessage::Text(encode_frame(&msg)))
            .await
            .is_err()
        {
            bridge.unregister_client(&session_id, &client_tx).await;
            return;
        }
    }

    if !snapshot.cli_connected && !snapshot.has_external_handler {
        let msg = json!({"type": "cli_disconnected"});
        if ws_sink
            .send(AxumWsMessage::Text(encode_frame(&msg)))
            .await
            .is_err()
        {
            bridge.unregister_client(&session_id, &client_tx).await;
            return;
        }
    }

    // Write pump: drain channel → WS sink.
    let session_id_write = session_id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_sink.send(AxumWsMessage::Text(msg)).await.is_err() {
                debug!("Browser socket write failed for session {session_id_write}");
                break;
            }
        }
        debug!("Browser write pump ended for session {session_id_write}");
    });

    // Read loop: WS stream → parse → route via bridge.
    let origin = format!("browser {session_id}");
    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                for value in decode_frames(&text, &origin) {
                    bridge.route_client_message(&session_id, value).await;
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                info!("Browser closed connection to session {session_id}");
                break;
            }
            Ok(AxumWsMessage::Ping(_)) | Ok(AxumWsMessage::Pong(_)) => {}
            Ok(_) => {}
            Err(e) => {
                error!("Browser socket error for session {session_id}: {e}");
                break;
            }
        }
    }

    bridge.unregister_client(&session_id, &client_tx).await;
    write_task.abort();
    info!("Browser detached from session {session_id}");
}
