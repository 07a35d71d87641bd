//! Interaction request and response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::UserId;

/// Kind of human-in-the-loop pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Permission,
    Question,
    Plan,
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteractionKind::Permission => write!(f, "permission"),
            InteractionKind::Question => write!(f, "question"),
            InteractionKind::Plan => write!(f, "plan"),
        }
    }
}

/// Information about a question option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QuestionOption {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: None,
        }
    }
}

/// What the agent is asking for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionPrompt {
    /// Permission to run a tool with the given arguments
    Permission {
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// A clarifying question, optionally with suggested answers
    Question {
        question: String,
        #[serde(default)]
        options: Vec<QuestionOption>,
    },
    /// Approval of a proposed plan
    Plan { plan: String },
}

impl InteractionPrompt {
    pub fn kind(&self) -> InteractionKind {
        match self {
            InteractionPrompt::Permission { .. } => InteractionKind::Permission,
            InteractionPrompt::Question { .. } => InteractionKind::Question,
            InteractionPrompt::Plan { .. } => InteractionKind::Plan,
        }
    }
}

/// An outstanding request, owned by the broker for the length of one pause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRequest {
    pub id: String,
    pub user_id: UserId,
    pub prompt: InteractionPrompt,
    pub created_at: DateTime<Utc>,
}

impl InteractionRequest {
    pub fn new(user_id: UserId, prompt: InteractionPrompt) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            prompt,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> InteractionKind {
        self.prompt.kind()
    }
}

/// Decision on a proposed plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlanDecision {
    Approved,
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
}

impl PlanDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, PlanDecision::Approved)
    }
}

/// The user's answer to an interaction request
///
/// Each variant carries everything the agent needs, so recording a response
/// is a single value hand-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionResponse {
    Permission {
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clarification: Option<String>,
    },
    Question { answer: String },
    Plan { decision: PlanDecision },
}

impl InteractionResponse {
    pub fn kind(&self) -> InteractionKind {
        match self {
            InteractionResponse::Permission { .. } => InteractionKind::Permission,
            InteractionResponse::Question { .. } => InteractionKind::Question,
            InteractionResponse::Plan { .. } => InteractionKind::Plan,
        }
    }

    /// The negative decision used when nobody answered in time
    pub fn declined(kind: InteractionKind) -> Self {
        match kind {
            InteractionKind::Permission => InteractionResponse::Permission {
                approved: false,
                clarification: None,
            },
            InteractionKind::Question => InteractionResponse::Question {
                answer: String::new(),
            },
            InteractionKind::Plan => InteractionResponse::Plan {
                decision: PlanDecision::Rejected { feedback: None },
            },
        }
    }
}

/// How a wait on the broker ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Responded(InteractionResponse),
    TimedOut,
    Cancelled,
}
