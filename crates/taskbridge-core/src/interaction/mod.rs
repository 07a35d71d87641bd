//! Interaction module - human-in-the-loop pauses
//!
//! A turn pauses when the agent needs a decision: permission to run a tool,
//! an answer to a question, or approval of a plan. The `InteractionBroker`
//! correlates the single outstanding request of a user with the response
//! that eventually arrives from a button press or a typed answer.
//!
//! ```text
//!   turn ── open ──▶ [slot: request + oneshot] ◀── respond / cancel ── UI
//!     └──── await_response(timeout) ◀── signal ────┘
//! ```

mod broker;
mod types;

pub use broker::{InteractionBroker, RequestHandle};
pub use types::{
    InteractionKind, InteractionPrompt, InteractionRequest, InteractionResponse, PlanDecision,
    QuestionOption, WaitOutcome,
};
