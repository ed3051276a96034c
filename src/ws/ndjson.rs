//! Wire framing for the two bridge sockets.
//!
//! Both the subprocess channel and the browser channel carry UTF-8 text
//! frames of newline-delimited JSON; one WebSocket frame may carry several
//! objects. Every message the routers understand is an envelope dispatched
//! on its `type` tag, so only JSON objects pass through here. Scalars,
//! arrays, and malformed lines are dropped with a note naming the socket
//! that sent them, per the protocol-error handling rule: drop the frame,
//! keep the connection.

use serde_json::Value;
use tracing::warn;

/// Split a text frame into its JSON object envelopes.
///
/// `origin` names the sending socket (e.g. `subprocess <id>`,
/// `browser <id>`) so a misbehaving peer is identifiable in the log.
pub fn decode_frames(raw: &str, origin: &str) -> Vec<Value> {
    let mut envelopes = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => envelopes.push(value),
            Ok(other) => {
                warn!("Dropping non-object frame from {origin}: {other}");
            }
            Err(e) => {
                warn!("Dropping malformed frame from {origin}: {e}");
            }
        }
    }
    envelopes
}

/// Serialize an envelope as a single newline-terminated line.
pub fn encode_frame(value: &Value) -> String {
    format!("{value}\n")
}
