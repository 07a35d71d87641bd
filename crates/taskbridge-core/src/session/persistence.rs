//! Session persistence - working-directory preferences and continuation handles
//!
//! The engine reads a user's stored session once, at the start of their
//! first turn, and writes it back after every completed turn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{ContinuationHandle, ModeFlags, UserId, UserSession};
use crate::error::{Error, Result};

/// Stored form of a user's session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub user_id: UserId,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationHandle>,
    #[serde(default)]
    pub flags: ModeFlags,
    pub updated_at: DateTime<Utc>,
}

impl From<&UserSession> for PersistedSession {
    fn from(session: &UserSession) -> Self {
        Self {
            user_id: session.user_id,
            working_directory: session.working_directory.clone(),
            continuation: session.continuation.clone(),
            flags: session.flags,
            updated_at: session.updated_at,
        }
    }
}

/// Storage collaborator for persisted sessions
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn load(&self, user_id: UserId) -> Result<Option<PersistedSession>>;

    async fn save(&self, session: &PersistedSession) -> Result<()>;

    async fn delete(&self, user_id: UserId) -> Result<()>;
}

/// In-memory repository
#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<UserId, PersistedSession>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn load(&self, user_id: UserId) -> Result<Option<PersistedSession>> {
        Ok(self.sessions.read().get(&user_id).cloned())
    }

    async fn save(&self, session: &PersistedSession) -> Result<()> {
        self.sessions.write().insert(session.user_id, session.clone());
        Ok(())
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        self.sessions.write().remove(&user_id);
        Ok(())
    }
}

/// One pretty-printed JSON file per user
pub struct JsonSessionRepository {
    dir: PathBuf,
}

impl JsonSessionRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, user_id: UserId) -> PathBuf {
        self.dir.join(format!("{}.json", user_id))
    }
}

#[async_trait]
impl SessionRepository for JsonSessionRepository {
    async fn load(&self, user_id: UserId) -> Result<Option<PersistedSession>> {
        let path = self.path_for(user_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Repository(format!("Failed to read {:?}: {}", path, e))),
        };
        let saved: PersistedSession = serde_json::from_str(&json)?;
        Ok(Some(saved))
    }

    async fn save(&self, session: &PersistedSession) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(session.user_id);
        let json = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&path, json).await?;
        debug!(user_id = session.user_id, "Saved session to {:?}", path);
        Ok(())
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
