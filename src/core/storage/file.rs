//! File-backed session store.
//!
//! Layout: one directory per session id under the base directory, holding
//! `meta.json`, `state.json`, and `history.json`. Writes are atomic
//! (sibling `.tmp` file, fsync, rename) so a crash mid-write leaves the
//! previous good version intact. Saves land in a dirty buffer that a
//! background flusher drains every 500 ms; repeated saves for the same
//! (id, artifact) coalesce.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::traits::{PersistedSession, SessionStore};
use crate::ws::types::{HistoryEntry, SessionMeta, SessionState};

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.json";
const HISTORY_FILE: &str = "history.json";

#[derive(Default)]
struct PendingArtifacts {
    meta: Option<SessionMeta>,
    state: Option<SessionState>,
    history: Option<Vec<HistoryEntry>>,
}

impl PendingArtifacts {
    fn is_empty(&self) -> bool {
        self.meta.is_none() && self.state.is_none() && self.history.is_none()
    }
}

pub struct FileSessionStore {
    base_dir: PathBuf,
    pending: Mutex<HashMap<String, PendingArtifacts>>,
    /// Serializes flush passes against `remove`, so a drained buffer being
    /// written out cannot resurrect a session deleted concurrently.
    io_lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    /// Create the store and start its background flusher.
    pub fn new(base_dir: impl Into<PathBuf>) -> Arc<Self> {
        let base_dir = base_dir.into();
        if let Err(e) = std::fs::create_dir_all(&base_dir) {
            warn!("Failed to create sessions dir {}: {e}", base_dir.display());
        }
        let store = Arc::new(Self {
            base_dir,
            pending: Mutex::new(HashMap::new()),
            io_lock: tokio::sync::Mutex::new(()),
        });
        spawn_flusher(Arc::downgrade(&store));
        store
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    /// Drain the dirty buffer and write everything out. Failed writes are
    /// re-buffered for the next tick unless the session was removed or a
    /// newer value superseded them in the meantime.
    async fn flush_pass(&self) {
        let _io = self.io_lock.lock().await;
        let drained: Vec<(String, PendingArtifacts)> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };

        for (id, arts) in drained {
            let dir = self.session_dir(&id);
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!("Failed to create session dir for {id}: {e}");
                self.requeue(&id, arts);
                continue;
            }

            let mut failed = PendingArtifacts::default();
            if let Some(meta) = arts.meta {
                if write_json_atomic(&dir.join(META_FILE), &meta).await.is_err() {
                    failed.meta = Some(meta);
                }
            }
            if let Some(state) = arts.state {
                if write_json_atomic(&dir.join(STATE_FILE), &state).await.is_err() {
                    failed.state = Some(state);
                }
            }
            if let Some(history) = arts.history {
                if write_json_atomic(&dir.join(HISTORY_FILE), &history)
                    .await
                    .is_err()
                {
                    failed.history = Some(history);
                }
            }
            if !failed.is_empty() {
                self.requeue(&id, failed);
            }
        }
    }

    /// Put failed artifacts back, without clobbering anything newer.
    fn requeue(&self, id: &str, arts: PendingArtifacts) {
        let mut pending = self.pending.lock();
        let slot = pending.entry(id.to_string()).or_default();
        if slot.meta.is_none() {
            slot.meta = arts.meta;
        }
        if slot.state.is_none() {
            slot.state = arts.state;
        }
        if slot.history.is_none() {
            slot.history = arts.history;
        }
    }

    async fn load_inner(&self, id: &str) -> Option<PersistedSession> {
        let (pending_meta, pending_state, pending_history) = {
            let pending = self.pending.lock();
            match pending.get(id) {
                Some(p) => (p.meta.clone(), p.state.clone(), p.history.clone()),
                None => (None, None, None),
            }
        };

        let dir = self.session_dir(id);
        let meta = match pending_meta {
            Some(m) => Some(m),
            None => read_json::<SessionMeta>(&dir.join(META_FILE)).await,
        }?;

        let state = match pending_state {
            Some(s) => s,
            None => read_json::<SessionState>(&dir.join(STATE_FILE))
                .await
                .unwrap_or_else(|| SessionState::from_meta(&meta)),
        };

        let history = match pending_history {
            Some(h) => h,
            None => read_json::<Vec<HistoryEntry>>(&dir.join(HISTORY_FILE))
                .await
                .unwrap_or_default(),
        };

        Some(PersistedSession {
            meta,
            state,
            history,
        })
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save_meta(&self, id: &str, meta: &SessionMeta) {
        self.pending
            .lock()
            .entry(id.to_string())
            .or_default()
            .meta = Some(meta.clone());
    }

    async fn save_state(&self, id: &str, state: &SessionState) {
        self.pending
            .lock()
            .entry(id.to_string())
            .or_default()
            .state = Some(state.clone());
    }

    async fn save_history(&self, id: &str, history: &[HistoryEntry]) {
        self.pending
            .lock()
            .entry(id.to_string())
            .or_default()
            .history = Some(history.to_vec());
    }

    async fn load(&self, id: &str) -> Option<PersistedSession> {
        self.load_inner(id).await
    }

    async fn load_all(&self) -> Vec<PersistedSession> {
        let mut ids: Vec<String> = Vec::new();
        match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    // Session dirs are named by UUID; skip siblings like cron/.
                    if entry.path().is_dir() && uuid::Uuid::parse_str(&name).is_ok() {
                        ids.push(name);
                    }
                }
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to enumerate sessions dir: {e}");
                }
                return Vec::new();
            }
        }

        // Unflushed sessions may not have a directory yet.
        for id in self.pending.lock().keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        let mut sessions = Vec::new();
        for id in ids {
            if let Some(s) = self.load_inner(&id).await {
                sessions.push(s);
            }
        }
        sessions.sort_by(|a, b| a.meta.created_at.cmp(&b.meta.created_at));
        sessions
    }

    async fn remove(&self, id: &str) {
        let _io = self.io_lock.lock().await;
        self.pending.lock().remove(id);
        let dir = self.session_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove session dir for {id}: {e}");
            }
        }
    }

    async fn flush(&self) {
        self.flush_pass().await;
    }
}

fn spawn_flusher(store: Weak<FileSessionStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match store.upgrade() {
                Some(store) => store.flush_pass().await,
                None => break,
            }
        }
    });
}

/// Write JSON to `path` atomically: sibling temp file, fsync, rename.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    let result: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
    .await;

    if let Err(e) = &result {
        warn!("Failed to write {}: {e}", path.display());
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Read and parse a JSON file; corrupt or missing content yields `None`.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {e}", path.display());
            }
            return None;
        }
    };
    match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Corrupt JSON in {}: {e}", path.display());
            debug!("Corrupt content length: {}", data.len());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::types::Provider;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn meta(id: &str) -> SessionMeta {
        SessionMeta {
            id: id.to_string(),
            pid: Some(4242),
            model: Some("m1".to_string()),
            permission_mode: None,
            provider: Provider::Claude,
            cwd: "/work".to_string(),
            created_at: Utc::now(),
            session_name: None,
            last_activity_at: None,
        }
    }

    #[tokio::test]
    async fn load_after_save_without_flush() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());

        let id = uuid::Uuid::new_v4().to_string();
        store.save_meta(&id, &meta(&id)).await;
        let mut state = SessionState::new(id.clone());
        state.model = "m1".to_string();
        store.save_state(&id, &state).await;

        // Nothing on disk yet, but the read must see the buffered values.
        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.meta.id, id);
        assert_eq!(loaded.state.model, "m1");
        assert!(loaded.history.is_empty());
    }

    #[tokio::test]
    async fn flush_persists_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        {
            let store = FileSessionStore::new(dir.path());
            store.save_meta(&id, &meta(&id)).await;
            store
                .save_history(
                    &id,
                    &[
                        HistoryEntry::UserMessage {
                            content: json!("hi"),
                            timestamp: 1,
                        },
                        HistoryEntry::Result { data: json!({}) },
                    ],
                )
                .await;
            store.flush().await;
        }

        let store = FileSessionStore::new(dir.path());
        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.meta.pid, Some(4242));
        assert_eq!(loaded.history.len(), 2);
        assert!(loaded.history[0].is_user_message());
    }

    #[tokio::test]
    async fn missing_state_defaults_from_meta() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = uuid::Uuid::new_v4().to_string();
        store.save_meta(&id, &meta(&id)).await;
        store.flush().await;

        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.state.id, id);
        assert_eq!(loaded.state.model, "m1");
        assert_eq!(loaded.state.cwd, "/work");
    }

    #[tokio::test]
    async fn corrupt_state_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = uuid::Uuid::new_v4().to_string();
        store.save_meta(&id, &meta(&id)).await;
        store.flush().await;

        std::fs::write(dir.path().join(&id).join("state.json"), "{ not json").unwrap();
        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.state.id, id);
        assert_eq!(loaded.state.total_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn load_missing_session_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.load("does-not-exist").await.is_none());
    }

    #[tokio::test]
    async fn remove_cancels_pending_writes() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = uuid::Uuid::new_v4().to_string();

        store.save_meta(&id, &meta(&id)).await;
        store.remove(&id).await;
        store.flush().await;

        assert!(store.load(&id).await.is_none());
        assert!(!dir.path().join(&id).exists());
    }

    #[tokio::test]
    async fn load_all_orders_by_creation() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());

        let mut first = meta(&uuid::Uuid::new_v4().to_string());
        first.created_at = Utc::now() - chrono::Duration::minutes(5);
        let second = meta(&uuid::Uuid::new_v4().to_string());

        store.save_meta(&second.id, &second).await;
        store.save_meta(&first.id, &first).await;
        store.flush().await;

        let all = store.load_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].meta.id, first.id);
        assert_eq!(all[1].meta.id, second.id);
    }

    #[tokio::test]
    async fn load_all_skips_non_session_dirs() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("cron")).unwrap();

        let id = uuid::Uuid::new_v4().to_string();
        store.save_meta(&id, &meta(&id)).await;
        store.flush().await;

        let all = store.load_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].meta.id, id);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = uuid::Uuid::new_v4().to_string();
        store.save_meta(&id, &meta(&id)).await;
        store.flush().await;

        let names: Vec<String> = std::fs::read_dir(dir.path().join(&id))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }
}
