//! Chat transport contract
//!
//! The transport client (send/edit/delete against the chat service) lives
//! outside this crate. The engine only needs the narrow surface below; the
//! Update Renderer absorbs every `TransportError` it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::interaction::InteractionRequest;
use crate::render::markup;
use crate::session::UserId;

/// Handle to a message previously sent through the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub chat_id: UserId,
    pub message_id: i64,
}

impl MessageHandle {
    pub fn new(chat_id: UserId, message_id: i64) -> Self {
        Self { chat_id, message_id }
    }
}

/// How the transport should interpret a message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFormat {
    /// Chat HTML subset (`b`, `i`, `s`, `code`, `pre`, `blockquote`)
    Html,
    /// No markup at all
    Plain,
}

/// Outbound message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundText {
    pub body: String,
    pub format: TextFormat,
}

impl OutboundText {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            format: TextFormat::Html,
        }
    }

    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            format: TextFormat::Plain,
        }
    }

    pub fn len(&self) -> usize {
        self.body.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Outbound side of the chat service
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Hard per-message limit enforced by the service, if it reports one
    fn max_message_len(&self) -> Option<usize> {
        None
    }

    async fn send(&self, user_id: UserId, text: &OutboundText) -> Result<MessageHandle, TransportError>;

    async fn edit(&self, handle: &MessageHandle, text: &OutboundText) -> Result<(), TransportError>;

    async fn delete(&self, handle: &MessageHandle) -> Result<(), TransportError>;

    /// Show an interactive request to the user
    ///
    /// Transports with buttons override this; the default sends the prompt
    /// as a formatted message.
    async fn present_interaction(
        &self,
        user_id: UserId,
        request: &InteractionRequest,
    ) -> Result<MessageHandle, TransportError> {
        self.send(user_id, &OutboundText::html(markup::describe_interaction(request)))
            .await
    }
}
