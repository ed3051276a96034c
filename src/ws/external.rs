//! External-handler capability.
//!
//! Non-default providers replace the subprocess half of a session. A
//! registered handler receives browser messages through this trait and
//! feeds browser-directed events back via `WsBridge::inject_to_browsers`.
//! The handler path and the subprocess path are mutually exclusive per
//! session; the bridge prefers the handler when both exist.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ExternalHandler: Send + Sync {
    /// Forward one browser-originated message for `session_id`.
    async fn handle_browser_message(&self, session_id: &str, message: Value);
}
