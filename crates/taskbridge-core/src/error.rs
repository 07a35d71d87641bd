//! Error types for TaskBridge Core

use std::time::Duration;
use thiserror::Error;

use crate::interaction::InteractionKind;
use crate::session::UserId;

/// Result type alias using TaskBridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// TaskBridge error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("User {user_id} already has a running task")]
    Busy { user_id: UserId },

    #[error("User {user_id} already has a pending {kind} request")]
    AlreadyPending { user_id: UserId, kind: InteractionKind },

    #[error("No pending request for user {user_id}")]
    NoPendingRequest { user_id: UserId },

    #[error("User {user_id} answered a {got} request but a {expected} request is pending")]
    ResponseMismatch {
        user_id: UserId,
        expected: InteractionKind,
        got: InteractionKind,
    },

    #[error("Interactive wait timed out")]
    TimedOut,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Agent stream error: {0}")]
    AgentStream(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session repository error: {0}")]
    Repository(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reported by the chat transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Message content rejected: {0}")]
    BadContent(String),

    #[error("Message not found")]
    NotFound,

    #[error("Transport failure: {0}")]
    Other(String),
}

impl Error {
    /// Whether this error is a broker contract violation (a defect in the caller)
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::AlreadyPending { .. }
                | Error::NoPendingRequest { .. }
                | Error::ResponseMismatch { .. }
        )
    }
}
