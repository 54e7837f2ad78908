//! Session domain: the persisted unit of conversation and merged state.
//!
//! A session is owned by its id. Every mutation goes through a single
//! [`SessionUpdate`] applied by a [`SessionStore`], which persists it
//! atomically and bumps the session version.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::ConversationTurn;

/// Flat key → opaque JSON value map. Ordered so persisted files and
/// rendered prompts are stable.
pub type StateMap = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids become file names, so only `[A-Za-z0-9_-]` is accepted.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Finished,
    Cancelled,
    Failed,
    Expired,
}

impl SessionStatus {
    /// Finished and expired sessions accept no further turns or state.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Finished | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted conversation plus its merged key/value state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Ordered transcript
    #[serde(default)]
    pub turns: Vec<ConversationTurn>,

    /// Authoritative merged state
    #[serde(default)]
    pub state: StateMap,

    #[serde(default)]
    pub status: SessionStatus,

    /// Bumped on every persisted write
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Create a new active session with the given initial state.
    pub fn new(initial_state: StateMap) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            turns: Vec::new(),
            state: initial_state,
            status: SessionStatus::Active,
            version: 0,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Apply an update in memory. Stores call this under their per-session
    /// lock and persist the result.
    ///
    /// Delta keys are merged last-write-wins. Closed sessions reject any
    /// content and any status change; repeating the closing status is a no-op.
    pub fn apply_update(&mut self, update: SessionUpdate) -> Result<(), StoreError> {
        if self.status.is_closed() {
            let same_status = update.status.is_none_or(|s| s == self.status);
            if update.is_content_empty() && same_status {
                return Ok(());
            }
            return Err(StoreError::Closed {
                id: self.id.to_string(),
                status: self.status.to_string(),
            });
        }

        self.turns.extend(update.turns);
        for (key, value) in update.delta {
            self.state.insert(key, value);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        self.version += 1;
        self.last_activity_at = Utc::now();
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            turns: self.turns.len(),
            version: self.version,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// One atomic write against a session.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub turns: Vec<ConversationTurn>,
    pub delta: StateMap,
    pub status: Option<SessionStatus>,
}

impl SessionUpdate {
    pub fn turns(turns: Vec<ConversationTurn>) -> Self {
        Self {
            turns,
            ..Self::default()
        }
    }

    pub fn delta(delta: StateMap) -> Self {
        Self {
            delta,
            ..Self::default()
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn is_content_empty(&self) -> bool {
        self.turns.is_empty() && self.delta.is_empty()
    }
}

/// A listing row for a stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub status: SessionStatus,
    pub turns: usize,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Exclusive right to drive one session. Released on drop.
pub struct SessionLock {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SessionLock {
    /// A lock with nothing to release. Enough for stores private to one process.
    pub fn in_process() -> Self {
        Self { release: None }
    }

    /// A lock that runs `release` when dropped.
    pub fn releasing(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("releases", &self.release.is_some())
            .finish()
    }
}

/// Persistent session storage.
///
/// Implementations must make every `apply` atomic and must not serialize
/// writers of distinct sessions. The loop controller keeps one writer per
/// session: in-process leases cover a single process, and [`try_lock`]
/// covers every process sharing the same backing storage.
///
/// [`try_lock`]: SessionStore::try_lock
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name (e.g., "file", "in_memory").
    fn name(&self) -> &str;

    /// Create a new session and return its id.
    async fn create(&self, initial_state: StateMap) -> Result<SessionId, StoreError>;

    /// Load a session by id.
    async fn load(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Apply one update atomically and return the new session value.
    async fn apply(&self, id: &SessionId, update: SessionUpdate) -> Result<Session, StoreError>;

    /// Summaries of every stored session.
    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError>;

    /// Claim the single-writer lock for `id`. `Ok(None)` means another
    /// holder has it.
    async fn try_lock(&self, _id: &SessionId) -> Result<Option<SessionLock>, StoreError> {
        Ok(Some(SessionLock::in_process()))
    }

    /// Append a single turn.
    async fn append(&self, id: &SessionId, turn: ConversationTurn) -> Result<Session, StoreError> {
        self.apply(id, SessionUpdate::turns(vec![turn])).await
    }

    /// Merge a state delta, last-write-wins per key.
    async fn merge_state(&self, id: &SessionId, delta: StateMap) -> Result<Session, StoreError> {
        self.apply(id, SessionUpdate::delta(delta)).await
    }

    /// Mark the session finished by caller command. The record is kept.
    async fn finish(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.apply(id, SessionUpdate::status(SessionStatus::Finished)).await
    }

    /// Mark the session expired after inactivity. The record is kept.
    async fn expire(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.apply(id, SessionUpdate::status(SessionStatus::Expired)).await
    }
}
