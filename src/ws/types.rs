//! Bridge data model.
//!
//! Core structures shared by the bridge, the launcher, and the store:
//! session state, persisted meta, typed conversation history, pending
//! permission requests, and the REST request/response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Which backend serves a session.
///
/// `Claude` is the local subprocess path; every other tag routes through a
/// registered external handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    /// External providers bypass the subprocess launcher entirely.
    pub fn is_external(&self) -> bool {
        !matches!(self, Provider::Claude)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Claude => write!(f, "claude"),
            Provider::Codex => write!(f, "codex"),
            Provider::Gemini => write!(f, "gemini"),
        }
    }
}

/// Seldom-changing session identity, persisted as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub provider: Provider,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Live session state, persisted as `state.json` and mutated on every
/// subprocess report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Canonical server-issued id. Never replaced by subprocess reports.
    pub id: String,
    /// The subprocess's own session id, kept only to feed `--resume` and the
    /// `session_id` field of outbound user frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_session_id: Option<String>,
    pub model: String,
    pub cwd: String,
    pub tools: Vec<String>,
    pub permission_mode: String,
    pub version: String,
    pub mcp_servers: Vec<Value>,
    pub agents: Vec<Value>,
    pub slash_commands: Vec<String>,
    pub skills: Vec<String>,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    pub context_used_percent: u8,
    pub is_compacting: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub archived: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl SessionState {
    pub fn new(id: String) -> Self {
        Self {
            id,
            cli_session_id: None,
            model: String::new(),
            cwd: String::new(),
            tools: Vec::new(),
            permission_mode: "default".to_string(),
            version: String::new(),
            mcp_servers: Vec::new(),
            agents: Vec::new(),
            slash_commands: Vec::new(),
            skills: Vec::new(),
            total_cost_usd: 0.0,
            num_turns: 0,
            context_used_percent: 0,
            is_compacting: false,
            archived: false,
        }
    }

    /// Seed a default state from persisted meta, for sessions whose
    /// `state.json` is missing or corrupt.
    pub fn from_meta(meta: &SessionMeta) -> Self {
        let mut state = Self::new(meta.id.clone());
        if let Some(model) = &meta.model {
            state.model = model.clone();
        }
        if let Some(mode) = &meta.permission_mode {
            state.permission_mode = mode.clone();
        }
        state.cwd = meta.cwd.clone();
        state
    }

    /// Apply a `system`/`init` payload from the subprocess.
    ///
    /// The reported `session_id` is captured as `cli_session_id` only; the
    /// canonical `id` is never overwritten from the wire.
    pub fn update_from_init(&mut self, data: &Value) {
        if let Some(s) = data.get("session_id").and_then(|v| v.as_str()) {
            self.cli_session_id = Some(s.to_string());
        }
        if let Some(m) = data.get("model").and_then(|v| v.as_str()) {
            self.model = m.to_string();
        }
        if let Some(c) = data.get("cwd").and_then(|v| v.as_str()) {
            self.cwd = c.to_string();
        }
        if let Some(arr) = data.get("tools").and_then(|v| v.as_array()) {
            self.tools = string_list(arr);
        }
        if let Some(p) = get_either(data, "permissionMode", "permission_mode").and_then(|v| v.as_str())
        {
            self.permission_mode = p.to_string();
        }
        if let Some(v) = data.get("version").and_then(|v| v.as_str()) {
            self.version = v.to_string();
        }
        if let Some(arr) = get_either(data, "mcp_servers", "mcpServers").and_then(|v| v.as_array()) {
            self.mcp_servers = arr.clone();
        }
        if let Some(arr) = data.get("agents").and_then(|v| v.as_array()) {
            self.agents = arr.clone();
        }
        if let Some(arr) =
            get_either(data, "slash_commands", "slashCommands").and_then(|v| v.as_array())
        {
            self.slash_commands = string_list(arr);
        }
        if let Some(arr) = data.get("skills").and_then(|v| v.as_array()) {
            self.skills = string_list(arr);
        }
        if let Some(pct) =
            get_either(data, "contextUsedPercent", "context_used_percent").and_then(|v| v.as_u64())
        {
            self.context_used_percent = pct.min(100) as u8;
        }
        if let Some(c) = get_either(data, "isCompacting", "is_compacting").and_then(|v| v.as_bool())
        {
            self.is_compacting = c;
        }
    }
}

/// Look up `primary`, falling back to `fallback`, for payloads whose key
/// casing varies between subprocess versions.
pub(crate) fn get_either<'a>(data: &'a Value, primary: &str, fallback: &str) -> Option<&'a Value> {
    data.get(primary).or_else(|| data.get(fallback))
}

fn string_list(arr: &[Value]) -> Vec<String> {
    arr.iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect()
}

/// One persisted conversation entry.
///
/// Stream deltas and permission prompts are deliberately not represented
/// here: deltas are reconstructible from the terminal assistant entry, and
/// permission prompts are ephemeral runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    UserMessage {
        content: Value,
        timestamp: u64,
    },
    Assistant {
        message: Value,
        #[serde(
            rename = "parentToolUseId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        parent_tool_use_id: Option<Value>,
    },
    Result {
        data: Value,
    },
}

impl HistoryEntry {
    pub fn is_user_message(&self) -> bool {
        matches!(self, HistoryEntry::UserMessage { .. })
    }
}

/// A permission round-trip awaiting a browser verdict. In-memory only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: u64,
}

/// Per-session bridge record: one subprocess sender, N browser senders,
/// state, pending permissions, typed history, and the pre-attach queue.
pub struct Session {
    pub id: String,
    /// Sender feeding the subprocess's WebSocket write pump.
    pub cli_tx: Option<mpsc::Sender<String>>,
    /// Senders feeding each attached browser's write pump.
    pub client_senders: Vec<mpsc::Sender<String>>,
    pub state: SessionState,
    pub pending_permissions: HashMap<String, PendingPermission>,
    /// Serialized frames queued while no subprocess socket is attached.
    pub pending_messages: Vec<String>,
    pub history: Vec<HistoryEntry>,
    pub first_message_received: bool,
}

impl Session {
    pub fn new(id: String) -> Self {
        Self {
            state: SessionState::new(id.clone()),
            id,
            cli_tx: None,
            client_senders: Vec::new(),
            pending_permissions: HashMap::new(),
            pending_messages: Vec::new(),
            history: Vec::new(),
            first_message_received: false,
        }
    }
}

/// Request body for session creation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionRequest {
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: Option<String>,
    pub provider: Option<Provider>,
    pub allowed_tools: Option<Vec<String>>,
    pub binary_override: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

/// Response body for session creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub ws_url: String,
    pub model: Option<String>,
    pub cwd: String,
    pub state: SessionState,
}

/// Request body for renaming a session.
#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub name: String,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
