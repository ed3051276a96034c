//! Result-boundary webhook notifier.
//!
//! When a webhook URL is configured, every `result` message POSTs a small
//! JSON document. Failures are logged and never retried.

use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client, url })
    }

    /// POST a waiting-for-input notification for `session_id`.
    pub async fn notify_waiting(
        &self,
        session_id: &str,
        session_name: Option<&str>,
        text: &str,
        session_url: Option<&str>,
    ) {
        let mut payload = json!({
            "text": text,
            "content": text,
            "event": "waiting_for_input",
            "sessionId": session_id,
            "sessionName": session_name,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(url) = session_url {
            payload["sessionUrl"] = json!(url);
        }

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Webhook delivered for session {session_id}");
            }
            Ok(resp) => {
                warn!(
                    "Webhook for session {session_id} returned status {}",
                    resp.status()
                );
            }
            Err(e) => {
                warn!("Webhook for session {session_id} failed: {e}");
            }
        }
    }
}
