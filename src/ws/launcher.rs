//! Subprocess launcher.
//!
//! Spawns the assistant CLI with `--sdk-url` pointed back at this server's
//! subprocess WebSocket endpoint, tracks every session's launcher record,
//! watches child exits, and provides graceful termination (SIGTERM, five
//! second grace, SIGKILL). Signals go through the `kill` command so no libc
//! binding is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::core::storage::SessionStore;
use crate::ws::types::{Provider, SessionMeta};

const KILL_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a launched session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchState {
    Starting,
    Connected,
    Running,
    Exited,
}

/// In-memory record for one session, owned by the launcher.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub state: LaunchState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    pub provider: Provider,
    pub cwd: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl LauncherRecord {
    fn meta(&self) -> SessionMeta {
        SessionMeta {
            id: self.id.clone(),
            pid: self.pid,
            model: self.model.clone(),
            permission_mode: self.permission_mode.clone(),
            provider: self.provider,
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            session_name: self.session_name.clone(),
            last_activity_at: self.last_activity_at,
        }
    }

    pub fn from_meta(meta: &SessionMeta, state: LaunchState, exit_code: Option<i32>) -> Self {
        Self {
            id: meta.id.clone(),
            pid: meta.pid,
            state,
            exit_code,
            model: meta.model.clone(),
            permission_mode: meta.permission_mode.clone(),
            provider: meta.provider,
            cwd: meta.cwd.clone(),
            created_at: meta.created_at,
            session_name: meta.session_name.clone(),
            archived: state == LaunchState::Exited,
            last_activity_at: meta.last_activity_at,
        }
    }
}

/// Spawn inputs.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub provider: Option<Provider>,
    pub cwd: Option<String>,
    pub binary_override: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub resume_id: Option<String>,
    pub session_name: Option<String>,
}

/// Published when a child exits, so the runtime can archive the bridge
/// record without the launcher holding a bridge reference.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub session_id: String,
    pub exit_code: i32,
}

/// Static launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Command name of the subprocess binary, e.g. `claude`.
    pub binary: String,
    /// Port the subprocess connects back to.
    pub port: u16,
    /// `wss` instead of `ws` in the callback URL.
    pub tls: bool,
    /// Children get `NODE_TLS_REJECT_UNAUTHORIZED=0` when the server cert
    /// is self-signed.
    pub self_signed: bool,
    /// Default working directory when the caller supplies none.
    pub default_cwd: Option<PathBuf>,
}

pub struct CliLauncher {
    sessions: Arc<RwLock<HashMap<String, LauncherRecord>>>,
    /// Sessions whose child process was spawned by this runtime, as opposed
    /// to restored records whose pid belongs to an earlier run.
    owned: Arc<RwLock<HashSet<String>>>,
    store: Arc<dyn SessionStore>,
    config: LauncherConfig,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl CliLauncher {
    pub fn new(
        config: LauncherConfig,
        store: Arc<dyn SessionStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: Arc::new(RwLock::new(HashMap::new())),
                owned: Arc::new(RwLock::new(HashSet::new())),
                store,
                config,
                exit_tx,
            },
            exit_rx,
        )
    }

    /// The URL a spawned subprocess connects back to.
    fn subprocess_url(&self, session_id: &str) -> String {
        let scheme = if self.config.tls { "wss" } else { "ws" };
        format!(
            "{scheme}://127.0.0.1:{}/ws/sub/{session_id}",
            self.config.port
        )
    }

    /// Launch a new session.
    ///
    /// External providers get a record in `starting` and no child; their
    /// handler reports readiness asynchronously. A spawn error likewise
    /// leaves the record in `starting`; the bridge surfaces the missing
    /// subprocess as `cli_disconnected`.
    pub async fn launch(&self, opts: LaunchOptions) -> LauncherRecord {
        let id = uuid::Uuid::new_v4().to_string();
        let provider = opts.provider.unwrap_or_default();
        let cwd = opts
            .cwd
            .clone()
            .or_else(|| {
                self.config
                    .default_cwd
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| ".".to_string());

        let mut record = LauncherRecord {
            id: id.clone(),
            pid: None,
            state: LaunchState::Starting,
            exit_code: None,
            model: opts.model.clone(),
            permission_mode: opts.permission_mode.clone(),
            provider,
            cwd: cwd.clone(),
            created_at: Utc::now(),
            session_name: opts.session_name.clone(),
            archived: false,
            last_activity_at: None,
        };

        if provider.is_external() {
            info!("Session {id} delegated to external provider {provider}");
            self.insert_and_persist(record.clone()).await;
            return record;
        }

        let binary = resolve_binary(&self.config.binary, opts.binary_override.as_deref());
        let sdk_url = self.subprocess_url(&id);

        let mut cmd = Command::new(&binary);
        cmd.arg("--sdk-url")
            .arg(&sdk_url)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("-p")
            .arg(""); // placeholder prompt, ignored in sdk-url mode

        if let Some(resume_id) = &opts.resume_id {
            cmd.arg("--resume").arg(resume_id);
        }
        if let Some(model) = &opts.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(mode) = &opts.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }
        if let Some(tools) = &opts.allowed_tools {
            if !tools.is_empty() {
                cmd.arg("--allowed-tools").arg(tools.join(","));
            }
        }

        cmd.current_dir(&cwd);
        // The suppressed variable lets a wrapped assistant spawn its own
        // nested instances of itself.
        cmd.env_remove("CLAUDECODE");
        if self.config.self_signed {
            cmd.env("NODE_TLS_REJECT_UNAUTHORIZED", "0");
        }
        if let Some(env) = &opts.env {
            cmd.envs(env);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("Launching subprocess for session {id}: {sdk_url}");
        debug!("Subprocess command: {cmd:?}");

        match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id();
                record.pid = pid;
                info!("Subprocess launched for session {id}, pid={pid:?}");

                self.owned.write().await.insert(id.clone());
                self.insert_and_persist(record.clone()).await;

                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                self.spawn_exit_watcher(id.clone(), child, stdout, stderr);
            }
            Err(e) => {
                error!("Failed to spawn subprocess for session {id}: {e}");
                self.insert_and_persist(record.clone()).await;
            }
        }

        record
    }

    async fn insert_and_persist(&self, record: LauncherRecord) {
        self.store.save_meta(&record.id, &record.meta()).await;
        self.sessions
            .write()
            .await
            .insert(record.id.clone(), record);
    }

    fn spawn_exit_watcher(
        &self,
        session_id: String,
        mut child: tokio::process::Child,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) {
        let sessions = self.sessions.clone();
        let owned = self.owned.clone();
        let store = self.store.clone();
        let exit_tx = self.exit_tx.clone();

        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let sid = session_id.clone();
                tokio::spawn(async move {
                    use tokio::io::{AsyncBufReadExt, BufReader};
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!("[subprocess stdout {sid}] {line}");
                    }
                });
            }
            if let Some(stderr) = stderr {
                let sid = session_id.clone();
                tokio::spawn(async move {
                    use tokio::io::{AsyncBufReadExt, BufReader};
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        warn!("[subprocess stderr {sid}] {line}");
                    }
                });
            }

            let exit_code = match child.wait().await {
                Ok(status) => {
                    info!("Subprocess for session {session_id} exited: {status}");
                    status.code().unwrap_or(-1)
                }
                Err(e) => {
                    error!("Error waiting on subprocess (session {session_id}): {e}");
                    -1
                }
            };

            owned.write().await.remove(&session_id);
            let meta = {
                let mut sessions = sessions.write().await;
                sessions.get_mut(&session_id).map(|record| {
                    record.state = LaunchState::Exited;
                    record.exit_code = Some(exit_code);
                    record.archived = true;
                    record.meta()
                })
            };
            if let Some(meta) = meta {
                store.save_meta(&session_id, &meta).await;
            }

            let _ = exit_tx.send(ExitEvent {
                session_id,
                exit_code,
            });
        });
    }

    /// The subprocess socket attached; leave `exited` records alone.
    pub async fn mark_connected(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(id) {
            if record.state != LaunchState::Exited {
                record.state = LaunchState::Connected;
            }
        }
    }

    /// The session is streaming a turn.
    pub async fn mark_running(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(id) {
            if record.state != LaunchState::Exited {
                record.state = LaunchState::Running;
            }
        }
    }

    /// Record activity and persist the updated meta.
    pub async fn mark_activity(&self, id: &str) {
        let meta = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(id).map(|record| {
                record.last_activity_at = Some(Utc::now());
                record.meta()
            })
        };
        if let Some(meta) = meta {
            self.store.save_meta(id, &meta).await;
        }
    }

    /// Demote a record whose process is gone (pid monitor, recovery).
    pub async fn mark_exited(&self, id: &str, exit_code: i32) {
        let meta = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(id).map(|record| {
                record.state = LaunchState::Exited;
                record.exit_code = Some(exit_code);
                record.archived = true;
                record.meta()
            })
        };
        if let Some(meta) = meta {
            self.store.save_meta(id, &meta).await;
        }
    }

    /// Rename the session and persist.
    pub async fn set_session_name(&self, id: &str, name: &str) -> bool {
        let meta = {
            let mut sessions = self.sessions.write().await;
            sessions.get_mut(id).map(|record| {
                record.session_name = Some(name.to_string());
                record.meta()
            })
        };
        match meta {
            Some(meta) => {
                self.store.save_meta(id, &meta).await;
                true
            }
            None => false,
        }
    }

    /// Graceful kill: SIGTERM, then SIGKILL after the grace period if the
    /// process is still alive. Returns false for unknown sessions.
    pub async fn kill(&self, id: &str) -> bool {
        let pid = match self.sessions.read().await.get(id) {
            Some(record) => record.pid,
            None => return false,
        };

        if let Some(pid) = pid {
            signal_pid(pid, "-TERM");
            info!("Sent SIGTERM to pid {pid} for session {id}");
            tokio::spawn(async move {
                tokio::time::sleep(KILL_GRACE).await;
                if Self::pid_alive(pid) {
                    warn!("Pid {pid} survived SIGTERM, sending SIGKILL");
                    signal_pid(pid, "-KILL");
                }
            });
        }
        true
    }

    /// Signal-0 probe: does the pid exist and belong to us.
    pub fn pid_alive(pid: u32) -> bool {
        #[cfg(unix)]
        {
            std::process::Command::new("kill")
                .arg("-0")
                .arg(pid.to_string())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }

    pub async fn is_alive(&self, id: &str) -> bool {
        match self.sessions.read().await.get(id) {
            Some(record) => {
                record.state != LaunchState::Exited
                    && record.pid.map(Self::pid_alive).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Whether this runtime spawned (and still owns) the session's child.
    pub async fn has_process(&self, id: &str) -> bool {
        self.owned.read().await.contains(id)
    }

    /// Insert a record without spawning — startup recovery path.
    pub async fn restore_session(&self, record: LauncherRecord) {
        self.sessions
            .write()
            .await
            .insert(record.id.clone(), record);
    }

    pub async fn list_sessions(&self) -> Vec<LauncherRecord> {
        let sessions = self.sessions.read().await;
        let mut records: Vec<LauncherRecord> = sessions.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub async fn get_session(&self, id: &str) -> Option<LauncherRecord> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove_session(&self, id: &str) -> bool {
        self.owned.write().await.remove(id);
        self.sessions.write().await.remove(id).is_some()
    }

    /// Drop all exited records; returns the ids that were pruned so the
    /// caller can tear down their bridge and store counterparts.
    pub async fn prune_exited(&self) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, r)| r.state == LaunchState::Exited)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            sessions.remove(id);
        }
        ids
    }

    /// Kill every child this runtime owns; returns how many were signalled.
    pub async fn kill_all(&self) -> usize {
        let ids: Vec<String> = self.owned.read().await.iter().cloned().collect();
        let mut killed = 0;
        for id in ids {
            if self.kill(&id).await {
                killed += 1;
            }
        }
        killed
    }
}

fn signal_pid(pid: u32, signal: &str) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status();
    }
}

/// Resolve the subprocess binary: explicit override, then PATH, then the
/// usual install locations. When nothing matches, return the bare name and
/// let the spawn fail visibly.
fn resolve_binary(binary: &str, binary_override: Option<&str>) -> PathBuf {
    if let Some(path) = binary_override {
        return PathBuf::from(path);
    }

    if let Ok(path) = which::which(binary) {
        debug!("Found {binary} at {}", path.display());
        return path;
    }

    if let Some(home) = dirs::home_dir() {
        let locations = [
            home.join(".npm-global/bin").join(binary),
            PathBuf::from("/usr/local/bin").join(binary),
            home.join(".local/bin").join(binary),
            home.join("node_modules/.bin").join(binary),
            home.join(".yarn/bin").join(binary),
            PathBuf::from("/opt/homebrew/bin").join(binary),
            // Editor-extension bundled installs.
            home.join(format!(".{binary}/local")).join(binary),
        ];
        for path in &locations {
            if path.is_file() {
                debug!("Found {binary} at {}", path.display());
                return path.clone();
            }
        }
    }

    warn!("{binary} not found in PATH or standard locations, spawning anyway");
    PathBuf::from(binary)
}
