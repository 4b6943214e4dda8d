//! Durable session history, used for listing and resume.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;

use super::Turn;

/// A stored session with its full turn log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub title: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            created_at: now,
            updated_at: now,
            title: None,
            model_id: model_id.into(),
            turns: Vec::new(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            title: self.title.clone(),
            model_id: self.model_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            turn_count: self.turns.len(),
        }
    }
}

/// Listing entry without the turn log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: usize,
}

/// Session persistence. Turns are only ever appended.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn append_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StoreError>;

    async fn set_title(&self, session_id: &str, title: &str) -> Result<(), StoreError>;

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<(), StoreError>;

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// The user's sessions, most recently updated first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionSummary>, StoreError>;

    /// Returns whether the session existed.
    async fn delete(&self, session_id: &str) -> Result<bool, StoreError>;
}

fn newest_first(mut summaries: Vec<SessionSummary>) -> Vec<SessionSummary> {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    summaries
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, session_id: &str, f: impl FnOnce(&mut SessionRecord)) -> Result<(), StoreError> {
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound {
                session_id: session_id.to_string(),
            })?;
        f(&mut *record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn append_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StoreError> {
        self.update(session_id, |r| r.turns.push(turn.clone()))
    }

    async fn set_title(&self, session_id: &str, title: &str) -> Result<(), StoreError> {
        self.update(session_id, |r| r.title = Some(title.to_string()))
    }

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<(), StoreError> {
        self.update(session_id, |r| r.model_id = model_id.to_string())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.get(session_id).map(|r| r.value().clone()))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(newest_first(
            self.sessions
                .iter()
                .filter(|r| r.user_id == user_id)
                .map(|r| r.summary())
                .collect(),
        ))
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.remove(session_id).is_some())
    }
}

// ── Directory of JSON files ──────────────────────────────────────────────

/// One `<session-id>.json` per session. Writes go through a temp file and a
/// rename, so a crash never leaves a half-written record.
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        // Ids come from clients on resume; never let one escape the directory.
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(StoreError::NotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    async fn read(&self, path: &Path, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                session_id: session_id.to_string(),
                message: e.to_string(),
            })
    }

    async fn write(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;
        let json = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            session_id: record.id.clone(),
            message: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(&path, e))
    }

    async fn update(&self, session_id: &str, f: impl FnOnce(&mut SessionRecord) + Send) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(session_id)?;
        let mut record = self
            .read(&path, session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                session_id: session_id.to_string(),
            })?;
        f(&mut record);
        record.updated_at = Utc::now();
        self.write(&record).await
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(record).await
    }

    async fn append_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StoreError> {
        let turn = turn.clone();
        self.update(session_id, move |r| r.turns.push(turn)).await
    }

    async fn set_title(&self, session_id: &str, title: &str) -> Result<(), StoreError> {
        let title = title.to_string();
        self.update(session_id, move |r| r.title = Some(title)).await
    }

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<(), StoreError> {
        let model_id = model_id.to_string();
        self.update(session_id, move |r| r.model_id = model_id).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let Ok(path) = self.path_for(session_id) else {
            return Ok(None);
        };
        self.read(&path, session_id).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match self.read(&path, &id).await {
                Ok(Some(record)) if record.user_id == user_id => summaries.push(record.summary()),
                Ok(_) => {}
                Err(e) => tracing::warn!(session_id = id.as_str(), error = %e, "skipping unreadable session record"),
            }
        }
        Ok(newest_first(summaries))
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Ok(path) = self.path_for(session_id) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }
}
