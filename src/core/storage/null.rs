//! No-op store, for tests and ephemeral deployments.

use async_trait::async_trait;

use super::traits::{PersistedSession, SessionStore};
use crate::ws::types::{HistoryEntry, SessionMeta, SessionState};

/// Satisfies [`SessionStore`] without touching disk. `load` always misses.
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl SessionStore for NullStore {
    async fn save_meta(&self, _id: &str, _meta: &SessionMeta) {}

    async fn save_state(&self, _id: &str, _state: &SessionState) {}

    async fn save_history(&self, _id: &str, _history: &[HistoryEntry]) {}

    async fn load(&self, _id: &str) -> Option<PersistedSession> {
        None
    }

    async fn load_all(&self) -> Vec<PersistedSession> {
        Vec::new()
    }

    async fn remove(&self, _id: &str) {}

    async fn flush(&self) {}
}
