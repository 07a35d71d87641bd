//! Per-user state partitioning
//!
//! Every component that keeps state across tasks stores it in a
//! `UserPartition`: a read-mostly index from user id to a slot that is
//! locked on its own. The index write lock is taken only the first time a
//! user is seen, so activity of one user never waits on another user's slot.
//!
//! Slot locks are synchronous (`parking_lot`) and must never be held across
//! an `.await`.
//!
//! Slots are dropped again with [`UserPartition::remove_if`] once their
//! contents are back to idle, so the index only holds users with live state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::session::UserId;

/// Map of independently locked per-user slots
pub struct UserPartition<T> {
    slots: RwLock<HashMap<UserId, Arc<Mutex<T>>>>,
}

impl<T: Default> UserPartition<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Get the slot for a user, creating an empty one on first use
    pub fn slot(&self, user_id: UserId) -> Arc<Mutex<T>> {
        if let Some(slot) = self.slots.read().get(&user_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(T::default())))
            .clone()
    }

    /// Get the slot for a user only if it already exists
    pub fn existing(&self, user_id: UserId) -> Option<Arc<Mutex<T>>> {
        self.slots.read().get(&user_id).cloned()
    }

    /// Run a closure with the user's slot locked
    pub fn with<R>(&self, user_id: UserId, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot(user_id);
        let mut guard = slot.lock();
        f(&mut guard)
    }

    /// Drop the user's slot if `idle` holds for its contents
    ///
    /// A slot that another caller still holds a handle to is kept, so two
    /// slots never exist for one user. Returns whether the slot was removed.
    pub fn remove_if(&self, user_id: UserId, idle: impl FnOnce(&T) -> bool) -> bool {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get(&user_id) else {
            return false;
        };
        // New handles are only cloned under the index lock, which we hold
        if Arc::strong_count(slot) > 1 || !idle(&slot.lock()) {
            return false;
        }
        slots.remove(&user_id);
        true
    }

    /// User ids that currently have a slot
    pub fn users(&self) -> Vec<UserId> {
        self.slots.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl<T: Default> Default for UserPartition<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_created_once() {
        let partition: UserPartition<u32> = UserPartition::new();
        let a = partition.slot(7);
        let b = partition.slot(7);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(partition.len(), 1);
    }

    #[test]
    fn test_existing_does_not_create() {
        let partition: UserPartition<u32> = UserPartition::new();
        assert!(partition.existing(1).is_none());
        assert!(partition.is_empty());
    }

    #[test]
    fn test_with_mutates_in_place() {
        let partition: UserPartition<Vec<&str>> = UserPartition::new();
        partition.with(1, |v| v.push("a"));
        partition.with(1, |v| v.push("b"));
        partition.with(2, |v| v.push("z"));
        assert_eq!(partition.with(1, |v| v.clone()), vec!["a", "b"]);
        assert_eq!(partition.with(2, |v| v.len()), 1);

        let mut users = partition.users();
        users.sort();
        assert_eq!(users, vec![1, 2]);
    }

    #[test]
    fn test_remove_if_drops_idle_slot() {
        let partition: UserPartition<Vec<u32>> = UserPartition::new();
        partition.with(1, |v| v.push(1));

        assert!(!partition.remove_if(1, |v| v.is_empty()));
        partition.with(1, |v| v.clear());
        assert!(partition.remove_if(1, |v| v.is_empty()));
        assert!(partition.existing(1).is_none());
        assert!(!partition.remove_if(1, |_| true));
    }

    #[test]
    fn test_remove_if_keeps_slot_in_use() {
        let partition: UserPartition<u32> = UserPartition::new();
        let held = partition.slot(3);

        assert!(!partition.remove_if(3, |_| true));
        *held.lock() = 9;
        assert_eq!(partition.with(3, |v| *v), 9);

        drop(held);
        assert!(partition.remove_if(3, |_| true));
        assert!(partition.is_empty());
    }
}
