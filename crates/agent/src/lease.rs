//! Single-writer leases: one running loop per session id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use opsloop_core::session::SessionId;
use tracing::debug;

/// The set of session ids currently driven by a loop in this process.
#[derive(Clone, Default)]
pub struct SessionLeases {
    held: Arc<Mutex<HashSet<SessionId>>>,
}

impl SessionLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a session. `None` when another loop already holds it.
    pub fn try_acquire(&self, id: &SessionId) -> Option<SessionLease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(id.clone()) {
            return None;
        }
        debug!(session_id = %id, "Session lease acquired");
        Some(SessionLease {
            id: id.clone(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, id: &SessionId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }
}

/// Released on drop.
pub struct SessionLease {
    id: SessionId,
    held: Arc<Mutex<HashSet<SessionId>>>,
}

impl SessionLease {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        debug!(session_id = %self.id, "Session lease released");
    }
}
