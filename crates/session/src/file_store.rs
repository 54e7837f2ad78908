//! File-based session store: one JSON document per session.
//!
//! Storage location: `~/.opsloop/sessions/<id>.json`
//!
//! Every write serializes the whole session to a uniquely named temp file in
//! the same directory, fsyncs it, and renames it over the previous version, so
//! a crash mid-write leaves either the old or the new document on disk.
//! Writes to one session are serialized by a per-session async mutex; writes
//! to distinct sessions never wait on each other.
//!
//! A running loop additionally holds `<id>.lock`, created exclusively, so two
//! processes sharing the directory never drive the same session. A process
//! that dies mid-run leaves the lock file behind; remove it by hand once no
//! other opsloop process is running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opsloop_core::error::StoreError;
use opsloop_core::session::{
    Session, SessionId, SessionLock, SessionStore, SessionSummary, SessionUpdate, StateMap,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// A directory of `<id>.json` session documents.
pub struct FileSessionStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "File session store opened");
        Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for a session id.
    pub fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Path of the cross-process lock file for a session id.
    pub fn lock_path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    fn check_id(id: &SessionId) -> Result<(), StoreError> {
        if id.is_valid() {
            Ok(())
        } else {
            Err(StoreError::InvalidId(id.to_string()))
        }
    }

    /// The write lock for one session.
    fn lock_for(&self, id: &SessionId) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| StoreError::Io("session lock table poisoned".into()))?;
        Ok(locks.entry(id.to_string()).or_default().clone())
    }

    /// Drop the table entry for `id` once no writer holds or awaits it.
    fn forget_lock(&self, id: &SessionId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(id.as_str())
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(id.as_str());
        }
    }

    async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StoreError::Io(format!(
                "Failed to create session directory {}: {e}",
                self.dir.display()
            ))
        })
    }

    async fn read(&self, id: &SessionId) -> Result<Session, StoreError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let session: Session =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupted {
                id: id.to_string(),
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if session.id != *id {
            return Err(StoreError::Corrupted {
                id: id.to_string(),
                path,
                reason: format!("document carries id '{}'", session.id),
            });
        }
        Ok(session)
    }

    /// Write-to-temp, fsync, rename.
    async fn write(&self, session: &Session) -> Result<(), StoreError> {
        self.ensure_dir().await?;

        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| StoreError::Io(format!("Failed to serialize session: {e}")))?;

        let target = self.path_for(&session.id);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", session.id, Uuid::new_v4().simple()));

        if let Err(e) = Self::write_synced(&tmp, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io(format!(
                "Failed to write {}: {e}",
                tmp.display()
            )));
        }

        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io(format!(
                "Failed to move session into place at {}: {e}",
                target.display()
            )));
        }

        debug!(
            session_id = %session.id,
            version = session.version,
            turns = session.turns.len(),
            "Session persisted"
        );
        Ok(())
    }

    async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn apply_locked(&self, id: &SessionId, update: SessionUpdate) -> Result<Session, StoreError> {
        let mut session = self.read(id).await?;
        let before = session.version;
        session.apply_update(update)?;
        if session.version != before {
            self.write(&session).await?;
        }
        Ok(session)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn create(&self, initial_state: StateMap) -> Result<SessionId, StoreError> {
        let session = Session::new(initial_state);
        self.write(&session).await?;
        Ok(session.id)
    }

    async fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        Self::check_id(id)?;
        self.read(id).await
    }

    async fn apply(&self, id: &SessionId, update: SessionUpdate) -> Result<Session, StoreError> {
        Self::check_id(id)?;
        let lock = self.lock_for(id)?;
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(id, update).await
        };
        drop(lock);
        self.forget_lock(id);
        result
    }

    async fn try_lock(&self, id: &SessionId) -> Result<Option<SessionLock>, StoreError> {
        Self::check_id(id)?;
        self.ensure_dir().await?;

        let path = self.lock_path_for(id);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(session_id = %id, path = %path.display(), "Session locked elsewhere");
                return Ok(None);
            }
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to create lock {}: {e}",
                    path.display()
                )));
            }
        };

        let owner = format!(
            "pid={} acquired_at={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        if let Err(e) = file.write_all(owner.as_bytes()).await {
            warn!(session_id = %id, error = %e, "Failed to record lock owner");
        }
        debug!(session_id = %id, "Session lock acquired");

        let session_id = id.to_string();
        Ok(Some(SessionLock::releasing(move || {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(session_id = %session_id, error = %e, "Failed to remove session lock");
            }
        })))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };
            let id = SessionId::from(stem);
            if !id.is_valid() {
                continue;
            }
            match self.read(&id).await {
                Ok(session) => summaries.push(session.summary()),
                Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }

        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsloop_core::message::ConversationTurn;
    use opsloop_core::session::SessionStatus;
    use opsloop_core::tool::ToolCallResult;
    use serde_json::json;

    fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn create_and_reload_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());

        let id = store
            .create(state(&[("namespace", json!("payments"))]))
            .await
            .unwrap();
        store
            .apply(
                &id,
                SessionUpdate {
                    turns: vec![
                        ConversationTurn::user("api is slow"),
                        ConversationTurn::tool(ToolCallResult::success(
                            "c1",
                            "get_pods",
                            json!({"ready": 2}),
                        )),
                    ],
                    delta: state(&[("pod", json!("api-1"))]),
                    status: None,
                },
            )
            .await
            .unwrap();
        let before = store.load(&id).await.unwrap();
        drop(store);

        // A fresh store instance stands in for a restarted process
        let reopened = FileSessionStore::new(dir.path());
        let after = reopened.load(&id).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(after.version, 1);
        assert_eq!(after.state["pod"], "api-1");
        assert_eq!(after.turns.len(), 2);
    }

    #[tokio::test]
    async fn writes_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = store.create(StateMap::new()).await.unwrap();
        for i in 0..3 {
            store
                .append(&id, ConversationTurn::user(format!("msg {i}")))
                .await
                .unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{id}.json")]);
    }

    #[tokio::test]
    async fn corrupted_file_is_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = store.create(StateMap::new()).await.unwrap();

        let path = store.path_for(&id);
        std::fs::write(&path, "{\"id\": \"truncated").unwrap();

        let err = store.load(&id).await.unwrap_err();
        match &err {
            StoreError::Corrupted { id: bad, path: p, .. } => {
                assert_eq!(bad, id.as_str());
                assert_eq!(p, &path);
            }
            other => panic!("Expected Corrupted, got {other:?}"),
        }
        assert!(err.to_string().contains("corrupted"));

        let err = store
            .append(&id, ConversationTurn::user("more"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
        assert!(path.exists());

        // Corrupted sessions are skipped in listings
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_and_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());

        let err = store.load(&SessionId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = store
            .load(&SessionId::from("../../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[tokio::test]
    async fn finished_sessions_are_closed_but_retained() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let id = store.create(StateMap::new()).await.unwrap();

        let finished = store.finish(&id).await.unwrap();
        assert_eq!(finished.status, SessionStatus::Finished);

        let err = store
            .merge_state(&id, state(&[("k", json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed { .. }));

        // Repeat finish is a no-op, the record stays on disk
        let again = store.finish(&id).await.unwrap();
        assert_eq!(again.version, finished.version);
        assert!(store.path_for(&id).exists());
    }

    #[tokio::test]
    async fn concurrent_writers_to_one_session_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSessionStore::new(dir.path()));
        let id = store.create(StateMap::new()).await.unwrap();

        let writes = (0..10).map(|i| {
            let store = store.clone();
            let id = id.clone();
            async move {
                let key = format!("k{i}");
                store.merge_state(&id, state(&[(key.as_str(), json!(i))])).await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        let session = store.load(&id).await.unwrap();
        assert_eq!(session.version, 10);
        assert_eq!(session.state.len(), 10);
        // Idle sessions do not keep a write-lock entry around
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_lock_is_shared_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileSessionStore::new(dir.path());
        let second = FileSessionStore::new(dir.path());
        let id = first.create(StateMap::new()).await.unwrap();

        let held = first.try_lock(&id).await.unwrap().expect("lock is free");
        assert!(first.lock_path_for(&id).exists());
        assert!(second.try_lock(&id).await.unwrap().is_none());
        assert!(first.try_lock(&id).await.unwrap().is_none());

        // The lock file is not a session document
        assert_eq!(second.list().await.unwrap().len(), 1);

        drop(held);
        assert!(!first.lock_path_for(&id).exists());
        let reacquired = second.try_lock(&id).await.unwrap();
        assert!(reacquired.is_some());

        let err = second
            .try_lock(&SessionId::from("../escape"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[tokio::test]
    async fn list_returns_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        let a = store.create(StateMap::new()).await.unwrap();
        let b = store.create(StateMap::new()).await.unwrap();
        store.expire(&b).await.unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        let b_summary = summaries.iter().find(|s| s.id == b).unwrap();
        assert_eq!(b_summary.status, SessionStatus::Expired);
        assert!(summaries.iter().any(|s| s.id == a));
    }
}
