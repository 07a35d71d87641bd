//! Session types
//!
//! A `UserSession` is never mutated in place once published; the `with_*`
//! helpers build the next snapshot from the current one.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::MessageHandle;

/// Chat user identifier
pub type UserId = i64;

/// Opaque resume token handed back by the agent at the end of a turn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationHandle(String);

impl ContinuationHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContinuationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution-mode flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags {
    /// Answer permission requests with "approved" without asking
    #[serde(default)]
    pub auto_approve: bool,
    /// Render only text and status, no tool activity lines
    #[serde(default)]
    pub brief_output: bool,
}

/// Per-user session snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct UserSession {
    pub user_id: UserId,
    pub working_directory: PathBuf,
    pub continuation: Option<ContinuationHandle>,
    pub flags: ModeFlags,
    /// Outbound message of the turn currently rendering, if any
    pub render_target: Option<MessageHandle>,
    /// Whether persisted preferences have been loaded into this session
    pub hydrated: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserSession {
    pub fn new(user_id: UserId, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            user_id,
            working_directory: working_directory.into(),
            continuation: None,
            flags: ModeFlags::default(),
            render_target: None,
            hydrated: false,
            updated_at: Utc::now(),
        }
    }

    fn next(&self) -> Self {
        Self {
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Change directory; the continuation handle is bound to the old one
    pub fn with_working_directory(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: dir.into(),
            continuation: None,
            ..self.next()
        }
    }

    pub fn with_continuation(&self, continuation: Option<ContinuationHandle>) -> Self {
        Self {
            continuation,
            ..self.next()
        }
    }

    pub fn with_flags(&self, flags: ModeFlags) -> Self {
        Self { flags, ..self.next() }
    }

    pub fn with_render_target(&self, render_target: Option<MessageHandle>) -> Self {
        Self {
            render_target,
            ..self.next()
        }
    }

    /// Mark the session as hydrated from storage, optionally taking stored values
    pub fn hydrated_from(&self, stored: Option<&super::PersistedSession>) -> Self {
        let mut next = self.next();
        if let Some(stored) = stored {
            next.working_directory = stored.working_directory.clone();
            next.continuation = stored.continuation.clone();
            next.flags = stored.flags;
        }
        next.hydrated = true;
        next
    }
}
