use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::SqliteBackend;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Done,
    Failed,
}

impl EntryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EntryState::Pending)
    }
}

/// One file waiting for the rename/upload pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub episode: String,
    pub season: String,
    pub quality: String,
    /// Telegram file id; `None` for manually typed placeholders.
    pub source_reference: Option<String>,
    pub original_filename: Option<String>,
    pub state: EntryState,
}

impl QueueEntry {
    pub fn pending(
        episode: impl Into<String>,
        season: impl Into<String>,
        quality: impl Into<String>,
        source_reference: Option<String>,
        original_filename: Option<String>,
    ) -> Self {
        Self {
            episode: episode.into(),
            season: season.into(),
            quality: quality.into(),
            source_reference,
            original_filename,
            state: EntryState::Pending,
        }
    }

    /// Moves a pending entry to `Done` or `Failed`. Terminal entries stay put.
    pub fn settle(&mut self, ok: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if ok { EntryState::Done } else { EntryState::Failed };
    }
}

/// Per-user rename configuration and work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: u64,
    pub thumbnail: Option<PathBuf>,
    pub metadata_text: Option<String>,
    pub rename_format: Option<String>,
    pub season_default: Option<String>,
    #[serde(default)]
    pub episode_queue: Vec<QueueEntry>,
    #[serde(default)]
    pub processing: bool,
}

impl Session {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            thumbnail: None,
            metadata_text: None,
            rename_format: None,
            season_default: None,
            episode_queue: Vec::new(),
            processing: false,
        }
    }
}

/// Partial update merged into a stored session. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub thumbnail: Option<PathBuf>,
    pub metadata_text: Option<String>,
    pub rename_format: Option<String>,
    pub season_default: Option<String>,
    pub episode_queue: Option<Vec<QueueEntry>>,
    pub processing: Option<bool>,
}

impl SessionPatch {
    pub fn processing(flag: bool) -> Self {
        Self {
            processing: Some(flag),
            ..Self::default()
        }
    }

    fn apply(self, session: &mut Session) {
        if let Some(v) = self.thumbnail {
            session.thumbnail = Some(v);
        }
        if let Some(v) = self.metadata_text {
            session.metadata_text = Some(v);
        }
        if let Some(v) = self.rename_format {
            session.rename_format = Some(v);
        }
        if let Some(v) = self.season_default {
            session.season_default = Some(v);
        }
        if let Some(v) = self.episode_queue {
            session.episode_queue = v;
        }
        if let Some(v) = self.processing {
            session.processing = v;
        }
    }
}

/// Raw persistence for whole session documents.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load(&self, user_id: u64) -> Result<Option<Session>, AppError>;
    async fn save(&self, session: &Session) -> Result<(), AppError>;
    async fn remove(&self, user_id: u64) -> Result<(), AppError>;
}

/// Transient backend; sessions die with the process.
#[derive(Default)]
pub struct MemoryBackend {
    sessions: DashMap<u64, Session>,
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn load(&self, user_id: u64) -> Result<Option<Session>, AppError> {
        Ok(self.sessions.get(&user_id).map(|s| s.clone()))
    }

    async fn save(&self, session: &Session) -> Result<(), AppError> {
        self.sessions.insert(session.user_id, session.clone());
        Ok(())
    }

    async fn remove(&self, user_id: u64) -> Result<(), AppError> {
        self.sessions.remove(&user_id);
        Ok(())
    }
}

/// Session operations used by the conversation and the batch processor.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    // serialises read-modify-write cycles
    write: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            write: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    /// Opens the SQLite backend at `path`, or falls back to memory when no path
    /// is configured or the database cannot be opened.
    pub async fn open(path: Option<&str>) -> Self {
        let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
            warn!("session_db not configured, sessions will not survive a restart");
            return Self::in_memory();
        };
        match SqliteBackend::open(path).await {
            Ok(backend) => {
                info!(path, "Session store opened");
                Self::new(Arc::new(backend))
            }
            Err(err) => {
                warn!(path, error = %err, "Session database unavailable, using in-memory sessions");
                Self::in_memory()
            }
        }
    }

    /// Starts a fresh session, replacing any existing one.
    pub async fn create(&self, user_id: u64) -> Result<Session, AppError> {
        let _guard = self.write.lock().await;
        let session = Session::new(user_id);
        self.backend.save(&session).await?;
        debug!(user = user_id, "Session created");
        Ok(session)
    }

    pub async fn read(&self, user_id: u64) -> Result<Option<Session>, AppError> {
        self.backend.load(user_id).await
    }

    /// Merges `patch` into the stored session. Returns `false` if none exists.
    pub async fn update(&self, user_id: u64, patch: SessionPatch) -> Result<bool, AppError> {
        let _guard = self.write.lock().await;
        let Some(mut session) = self.backend.load(user_id).await? else {
            return Ok(false);
        };
        patch.apply(&mut session);
        self.backend.save(&session).await?;
        Ok(true)
    }

    /// Pushes an entry to the end of the queue. Returns `false` if no session exists.
    pub async fn append_entry(&self, user_id: u64, entry: QueueEntry) -> Result<bool, AppError> {
        let _guard = self.write.lock().await;
        let Some(mut session) = self.backend.load(user_id).await? else {
            return Ok(false);
        };
        session.episode_queue.push(entry);
        self.backend.save(&session).await?;
        Ok(true)
    }

    pub async fn delete(&self, user_id: u64) -> Result<(), AppError> {
        let _guard = self.write.lock().await;
        self.backend.remove(user_id).await?;
        debug!(user = user_id, "Session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ep: &str) -> QueueEntry {
        QueueEntry::pending(ep, "01", "480p", Some(format!("file-{ep}")), None)
    }

    #[tokio::test]
    async fn create_overwrites_existing_session() {
        let store = SessionStore::in_memory();
        store.create(7).await.unwrap();
        store
            .update(
                7,
                SessionPatch {
                    metadata_text: Some("meta".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.create(7).await.unwrap();
        assert_eq!(store.read(7).await.unwrap(), Some(Session::new(7)));
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = SessionStore::in_memory();
        store.create(1).await.unwrap();
        store
            .update(
                1,
                SessionPatch {
                    metadata_text: Some("meta".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update(
                1,
                SessionPatch {
                    rename_format: Some("{ep}".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let s = store.read(1).await.unwrap().unwrap();
        assert_eq!(s.metadata_text.as_deref(), Some("meta"));
        assert_eq!(s.rename_format.as_deref(), Some("{ep}"));
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let store = SessionStore::in_memory();
        store.create(1).await.unwrap();
        for ep in ["10", "02", "05"] {
            assert!(store.append_entry(1, entry(ep)).await.unwrap());
        }
        let eps: Vec<_> = store
            .read(1)
            .await
            .unwrap()
            .unwrap()
            .episode_queue
            .into_iter()
            .map(|e| e.episode)
            .collect();
        assert_eq!(eps, vec!["10", "02", "05"]);
    }

    #[tokio::test]
    async fn writes_without_session_are_noops() {
        let store = SessionStore::in_memory();
        assert!(!store.append_entry(3, entry("01")).await.unwrap());
        assert!(!store.update(3, SessionPatch::processing(true)).await.unwrap());
        assert_eq!(store.read(3).await.unwrap(), None);
        store.delete(3).await.unwrap();
    }

    #[tokio::test]
    async fn missing_database_falls_back_to_memory() {
        let store = SessionStore::open(None).await;
        store.create(9).await.unwrap();
        assert!(store.read(9).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unopenable_database_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("sessions.db");
        let store = SessionStore::open(path.to_str()).await;

        store.create(9).await.unwrap();
        assert!(store.append_entry(9, entry("01")).await.unwrap());
        assert_eq!(store.read(9).await.unwrap().unwrap().episode_queue.len(), 1);
        assert!(!path.exists());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut e = entry("01");
        e.settle(false);
        assert_eq!(e.state, EntryState::Failed);
        e.settle(true);
        assert_eq!(e.state, EntryState::Failed);
    }
}
