//! Storage trait definitions.
//!
//! The store mirrors every session's identity, state, and conversation
//! history to disk. Implementations must be thread-safe (Send + Sync) as
//! they are shared across the bridge, the launcher, and the schedulers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ws::types::{HistoryEntry, SessionMeta, SessionState};

/// Everything persisted for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub meta: SessionMeta,
    pub state: SessionState,
    pub history: Vec<HistoryEntry>,
}

/// Durable per-session persistence.
///
/// `save_*` buffer the update and schedule a debounced flush; a read after a
/// save must observe the saved value whether or not a flush has happened.
/// Disk failures are logged and retried on the next tick, never surfaced to
/// callers; the bridge keeps serving.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_meta(&self, id: &str, meta: &SessionMeta);

    async fn save_state(&self, id: &str, state: &SessionState);

    async fn save_history(&self, id: &str, history: &[HistoryEntry]);

    /// Most recent logical value, blending unflushed buffers over the
    /// on-disk snapshot. `None` iff no meta was ever saved for `id`.
    async fn load(&self, id: &str) -> Option<PersistedSession>;

    /// All persisted sessions, ordered by creation time.
    async fn load_all(&self) -> Vec<PersistedSession>;

    /// Cancel pending writes for `id` and delete its directory.
    async fn remove(&self, id: &str);

    /// Force all buffered writes to disk before returning.
    async fn flush(&self);
}
