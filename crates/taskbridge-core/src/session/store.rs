//! Session Store - copy-on-write per-user snapshots

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::types::{UserId, UserSession};
use crate::partition::UserPartition;

/// Shared, immutable view of a user's session
pub type Snapshot = Arc<UserSession>;

/// Holds the current snapshot for every user
pub struct SessionStore {
    slots: UserPartition<Option<Snapshot>>,
    default_working_dir: PathBuf,
}

impl SessionStore {
    pub fn new(default_working_dir: impl Into<PathBuf>) -> Self {
        Self {
            slots: UserPartition::new(),
            default_working_dir: default_working_dir.into(),
        }
    }

    /// Current snapshot, creating a default session on first access
    pub fn get_or_create(&self, user_id: UserId) -> Snapshot {
        self.slots.with(user_id, |slot| {
            slot.get_or_insert_with(|| {
                debug!(user_id, "Creating session");
                Arc::new(UserSession::new(user_id, self.default_working_dir.clone()))
            })
            .clone()
        })
    }

    /// Current snapshot without creating one
    pub fn get(&self, user_id: UserId) -> Option<Snapshot> {
        let slot = self.slots.existing(user_id)?;
        let guard = slot.lock();
        guard.clone()
    }

    /// Apply a pure transformation to the current snapshot and install the result
    ///
    /// Calls for the same user are serialized: each mutator sees the snapshot
    /// installed by the previous one, never a stale copy.
    pub fn replace<F>(&self, user_id: UserId, mutator: F) -> Snapshot
    where
        F: FnOnce(&UserSession) -> UserSession,
    {
        self.slots.with(user_id, |slot| {
            let current = slot.get_or_insert_with(|| {
                Arc::new(UserSession::new(user_id, self.default_working_dir.clone()))
            });
            let mut next = mutator(current);
            next.user_id = user_id;
            let next = Arc::new(next);
            *slot = Some(next.clone());
            next
        })
    }

    /// Drop a user's session; the next access starts from defaults
    pub fn remove(&self, user_id: UserId) -> Option<Snapshot> {
        let slot = self.slots.existing(user_id)?;
        let mut guard = slot.lock();
        guard.take()
    }

    pub fn default_working_dir(&self) -> &PathBuf {
        &self.default_working_dir
    }
}
