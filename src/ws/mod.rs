//! WebSocket runtime: session bridging, subprocess supervision, and the
//! two upgrade endpoints.
//!
//! - subprocesses connect to `/ws/sub/:session_id` (NDJSON)
//! - browsers connect to `/ws/browser/:session_id`
//! - [`bridge::WsBridge`] routes between them, [`launcher::CliLauncher`]
//!   owns the child processes

pub mod bridge;
pub mod cli_handler;
pub mod client_handler;
pub mod external;
pub mod launcher;
pub mod ndjson;
pub mod types;
