//! In-memory session store: useful for testing and ephemeral runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use opsloop_core::error::StoreError;
use opsloop_core::session::{
    Session, SessionId, SessionStore, SessionSummary, SessionUpdate, StateMap,
};
use tokio::sync::RwLock;

/// Sessions kept in a map. Nothing survives the process.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed session, replacing any with the same id.
    pub async fn insert(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create(&self, initial_state: StateMap) -> Result<SessionId, StoreError> {
        let session = Session::new(initial_state);
        let id = session.id.clone();
        self.insert(session).await;
        Ok(id)
    }

    async fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn apply(&self, id: &SessionId, update: SessionUpdate) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        // Apply to a copy so a rejected update leaves the stored value untouched
        let mut next = stored.clone();
        next.apply_update(update)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(Session::summary)
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }
}
