//! In-memory registry of live ingest sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::state::Session;

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Session already active: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },
}

/// Thread-safe map of session id to live session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// Fails if a session with the same id exists and is not already ending.
    /// An entry that is Terminating is replaced; its worker later removes
    /// only its own entry via [`SessionRegistry::remove_entry`].
    pub async fn insert(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session.id())
            && !existing.is_ending()
        {
            return Err(RegistryError::DuplicateSession {
                session_id: session.id().to_string(),
            });
        }
        let id = session.id().to_string();
        if sessions.insert(id.clone(), session).is_some() {
            debug!(session_id = %id, "Replaced ending session entry");
        }
        drop(sessions);
        info!(session_id = %id, "Session registered");
        Ok(())
    }

    /// Look up a session by id.
    pub async fn lookup(&self, session_id: &str) -> Result<Arc<Session>, RegistryError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Remove a session by id. Removing an absent id is a no-op.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            info!(session_id, "Session unregistered");
        }
        removed
    }

    /// Remove `session` only if it is still the registered entry for its id.
    pub async fn remove_entry(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        let is_current = sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if is_current {
            sessions.remove(session.id());
        }
        drop(sessions);
        if is_current {
            info!(session_id = %session.id(), "Session unregistered");
        }
        is_current
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// All registered sessions.
    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
