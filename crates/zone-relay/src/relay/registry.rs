//! Registry of live relay sessions.
//!
//! Bookkeeping only: sessions register on accept and remove themselves on
//! close. Nothing in a session's protocol depends on this table except the
//! admission limit.

use super::session::SessionState;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;

/// A live session as seen by diagnostics.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: String,
    /// Remote address of the downstream client.
    pub remote: String,
    pub state: SessionState,
    /// Upstream scope once the session is authenticated.
    pub device: Option<String>,
    pub opened_at: Instant,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session unless `max_sessions` are already live.
    ///
    /// Returns `false` when the limit is reached or the id is taken.
    pub async fn try_register(&self, id: &str, remote: &str, max_sessions: usize) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= max_sessions || sessions.contains_key(id) {
            return false;
        }
        sessions.insert(
            id.to_string(),
            SessionEntry {
                id: id.to_string(),
                remote: remote.to_string(),
                state: SessionState::AwaitingAuth,
                device: None,
                opened_at: Instant::now(),
            },
        );
        debug!(session_id = %id, live = sessions.len(), "session registered");
        true
    }

    pub async fn set_state(&self, id: &str, state: SessionState) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.state = state;
        }
    }

    pub async fn set_device(&self, id: &str, device: String) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.device = Some(device);
        }
    }

    pub async fn unregister(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            debug!(session_id = %id, "session unregistered");
        }
    }

    #[cfg(test)]
    pub async fn get(&self, id: &str) -> Option<SessionEntry> {
        self.sessions.read().await.get(id).cloned()
    }

    /// List all live sessions.
    pub async fn list(&self) -> Vec<SessionEntry> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_update_unregister() {
        let registry = SessionRegistry::new();
        assert!(registry.try_register("s1", "127.0.0.1:5000", 10).await);
        registry.set_state("s1", SessionState::Relaying).await;
        registry.set_device("s1", "org/type/id".into()).await;

        let entry = registry.get("s1").await.unwrap();
        assert_eq!(entry.state, SessionState::Relaying);
        assert_eq!(entry.device.as_deref(), Some("org/type/id"));
        assert_eq!(registry.list().await.len(), 1);

        registry.unregister("s1").await;
        assert_eq!(registry.count().await, 0);
        registry.unregister("s1").await;
    }

    #[tokio::test]
    async fn enforces_limit() {
        let registry = SessionRegistry::new();
        assert!(registry.try_register("a", "r", 2).await);
        assert!(registry.try_register("b", "r", 2).await);
        assert!(!registry.try_register("c", "r", 2).await);
        registry.unregister("a").await;
        assert!(registry.try_register("c", "r", 2).await);
    }

    #[tokio::test]
    async fn rejects_duplicate_id() {
        let registry = SessionRegistry::new();
        assert!(registry.try_register("a", "r", 10).await);
        assert!(!registry.try_register("a", "r", 10).await);
    }

    #[tokio::test]
    async fn updates_to_unknown_ids_are_ignored() {
        let registry = SessionRegistry::new();
        registry.set_state("ghost", SessionState::Closing).await;
        registry.set_device("ghost", "x".into()).await;
        assert!(registry.get("ghost").await.is_none());
    }
}
