//! Subprocess WebSocket handler.
//!
//! Endpoint: `/ws/sub/:session_id`. The launched subprocess connects here
//! (it was given this URL via `--sdk-url`) and speaks NDJSON. Inbound
//! objects are routed to browsers through the bridge.

use super::bridge::WsBridge;
use super::ndjson::decode_frames;
use axum::{
    extract::{ws::Message as AxumWsMessage, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub async fn ws_sub_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(bridge): State<Arc<WsBridge>>,
) -> Response {
    if uuid::Uuid::parse_str(&session_id).is_err() {
        warn!("Rejected subprocess attach with malformed session id: {session_id}");
        return StatusCode::BAD_REQUEST.into_response();
    }
    info!("Subprocess WebSocket upgrade for session {session_id}");
    ws.on_upgrade(move |socket| handle_sub_socket(socket, session_id, bridge))
        .into_response()
}

async fn handle_sub_socket(
    socket: axum::extract::ws::WebSocket,
    session_id: String,
    bridge: Arc<WsBridge>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (cli_tx, mut cli_rx) = mpsc::channel::<String>(256);
    bridge.register_cli(&session_id, cli_tx.clone()).await;
    info!("Subprocess connected for session {session_id}");

    // Write pump: drain channel → WS sink.
    let session_id_write = session_id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(msg) = cli_rx.recv().await {
            if ws_sink.send(AxumWsMessage::Text(msg)).await.is_err() {
                warn!("Failed to write to subprocess socket for session {session_id_write}");
                break;
            }
        }
        debug!("Subprocess write pump ended for session {session_id_write}");
    });

    // Read loop: WS stream → parse NDJSON → route via bridge.
    let origin = format!("subprocess {session_id}");
    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                for value in decode_frames(&text, &origin) {
                    bridge.route_cli_message(&session_id, value).await;
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                info!("Subprocess socket closed for session {session_id}");
                break;
            }
            Ok(AxumWsMessage::Ping(_)) | Ok(AxumWsMessage::Pong(_)) => {}
            Ok(_) => {}
            Err(e) => {
                error!("Subprocess socket error for session {session_id}: {e}");
                break;
            }
        }
    }

    bridge.unregister_cli(&session_id, &cli_tx).await;
    write_task.abort();
    info!("Subprocess detached from session {session_id}");
}
