//! Session module - per-user snapshots
//!
//! Each user owns exactly one immutable `UserSession` snapshot at a time.
//! The `SessionStore` replaces snapshots wholesale through pure
//! transformations, so a reader never observes a half-applied update:
//!
//! ```text
//!   replace(user, f) ──▶ lock(user slot) ──▶ next = f(&current) ──▶ install(next)
//! ```
//!
//! Persistence of working-directory preferences and continuation handles is
//! delegated to a `SessionRepository`; the store itself only holds memory.

mod persistence;
mod store;
mod types;

pub use persistence::{JsonSessionRepository, MemorySessionRepository, PersistedSession, SessionRepository};
pub use store::{SessionStore, Snapshot};
pub use types::{ContinuationHandle, ModeFlags, UserId, UserSession};
