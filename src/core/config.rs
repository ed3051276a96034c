//! Runtime settings, sourced from the environment.
//!
//! Recognized variables: `PORT`, `SESSIONS_DIR`, `CERT_DIR`, `DEFAULT_CWD`,
//! `SESSION_TTL_DAYS`, `NODE_ENV`, `WEBHOOK_URL`, `BRIDGE_BINARY`.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listen port for the HTTP + WebSocket front.
    pub port: u16,
    /// Root of persisted session directories.
    pub sessions_dir: PathBuf,
    /// Directory holding the TLS cert + key when a terminator fronts the
    /// server. Presence selects the `wss` scheme for subprocess callbacks.
    pub cert_dir: Option<PathBuf>,
    /// Default working directory for spawned subprocesses.
    pub default_cwd: Option<PathBuf>,
    /// Age in days after which archived sessions are cleaned up. 0 disables.
    pub session_ttl_days: u64,
    /// `test` disables TLS expectations entirely.
    pub node_env: Option<String>,
    /// Webhook POSTed at each result boundary, when set.
    pub webhook_url: Option<String>,
    /// Command name of the subprocess binary.
    pub bridge_binary: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8443,
            sessions_dir: default_sessions_dir(),
            cert_dir: None,
            default_cwd: None,
            session_ttl_days: 30,
            node_env: None,
            webhook_url: None,
            bridge_binary: "claude".to_string(),
        }
    }
}

fn default_sessions_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-bridge")
        .join("sessions")
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::default())
            .build()?
            .try_deserialize()
    }

    pub fn is_test(&self) -> bool {
        self.node_env.as_deref() == Some("test")
    }

    /// TLS is expected whenever a cert directory is configured outside test
    /// mode. Issuance and termination happen outside this process.
    pub fn tls_enabled(&self) -> bool {
        !self.is_test() && self.cert_dir.is_some()
    }

    /// A configured cert dir is treated as self-signed; subprocess children
    /// get the TLS-verification allowance only in that case.
    pub fn self_signed(&self) -> bool {
        self.tls_enabled()
    }

    /// Directory for cron jobs/runs, parallel to the session directories.
    pub fn cron_dir(&self) -> PathBuf {
        self.sessions_dir.join("cron")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.port, 8443);
        assert_eq!(s.session_ttl_days, 30);
        assert_eq!(s.bridge_binary, "claude");
        assert!(!s.is_test());
        assert!(!s.tls_enabled());
    }

    #[test]
    fn test_mode_disables_tls() {
        let s = Settings {
            node_env: Some("test".to_string()),
            cert_dir: Some(PathBuf::from("/certs")),
            ..Settings::default()
        };
        assert!(s.is_test());
        assert!(!s.tls_enabled());
    }

    #[test]
    fn cert_dir_enables_tls() {
        let s = Settings {
            cert_dir: Some(PathBuf::from("/certs")),
            ..Settings::default()
        };
        assert!(s.tls_enabled());
        assert!(s.self_signed());
    }

    #[test]
    fn cron_dir_is_parallel_to_sessions() {
        let s = Settings {
            sessions_dir: PathBuf::from("/data/sessions"),
            ..Settings::default()
        };
        assert_eq!(s.cron_dir(), PathBuf::from("/data/sessions/cron"));
    }
}
