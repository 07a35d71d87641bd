//! Agent execution contract
//!
//! The engine does not know how the agent reasons or runs tools. It starts a
//! turn, reads the turn's event stream, and injects a resume value whenever
//! the stream pauses on an interactive event:
//!
//! ```text
//!   start_turn(request) ──▶ AgentTurn
//!        next_event() ──▶ text_delta | tool_start | tool_result | thinking
//!                       | permission_request | question_request | plan_request
//!                       | error | done
//!        resume(value)  ◀── after an interactive event
//!        cancel()
//! ```

mod process;

pub use process::ProcessAgent;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::interaction::{InteractionResponse, PlanDecision, QuestionOption};
use crate::session::{ContinuationHandle, UserId};

/// One event of a turn's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental output text (markdown)
    TextDelta { text: String },
    ToolStart {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    /// The stream is paused until a permission decision is injected
    PermissionRequest {
        tool_name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// The stream is paused until an answer is injected
    QuestionRequest {
        question: String,
        #[serde(default)]
        options: Vec<QuestionOption>,
    },
    /// The stream is paused until a plan decision is injected
    PlanRequest { plan: String },
    Thinking {
        #[serde(default)]
        text: String,
    },
    /// Unrecoverable agent failure
    Error { message: String },
    /// The turn finished; the handle resumes the conversation next turn
    Done {
        #[serde(default)]
        continuation: Option<ContinuationHandle>,
    },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::TextDelta { .. } => "text_delta",
            AgentEvent::ToolStart { .. } => "tool_start",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::PermissionRequest { .. } => "permission_request",
            AgentEvent::QuestionRequest { .. } => "question_request",
            AgentEvent::PlanRequest { .. } => "plan_request",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Error { .. } => "error",
            AgentEvent::Done { .. } => "done",
        }
    }
}

/// Value injected into a paused stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeValue {
    Permission {
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clarification: Option<String>,
    },
    Answer { answer: String },
    PlanDecision { decision: PlanDecision },
}

impl From<InteractionResponse> for ResumeValue {
    fn from(response: InteractionResponse) -> Self {
        match response {
            InteractionResponse::Permission {
                approved,
                clarification,
            } => ResumeValue::Permission {
                approved,
                clarification,
            },
            InteractionResponse::Question { answer } => ResumeValue::Answer { answer },
            InteractionResponse::Plan { decision } => ResumeValue::PlanDecision { decision },
        }
    }
}

/// Everything needed to start a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_id: UserId,
    pub input: String,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationHandle>,
}

/// Starts agent turns
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn start_turn(&self, request: TurnRequest) -> Result<Box<dyn AgentTurn>>;
}

/// A running turn
///
/// `next_event` must be cancel-safe: the orchestrator polls it inside
/// `select!` alongside flush timers and cancellation.
#[async_trait]
pub trait AgentTurn: Send {
    /// Next event, or `None` once the stream is over
    async fn next_event(&mut self) -> Option<Result<AgentEvent>>;

    /// Answer the interactive event the stream is paused on
    async fn resume(&mut self, value: ResumeValue) -> Result<()>;

    /// Abort the turn and release the underlying process
    async fn cancel(&mut self);
}
