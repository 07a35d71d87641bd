//! Turn state machine
//!
//! ```text
//!            Start              Wait(kind)
//!   IDLE ───────────▶ RUNNING ─────────────▶ WAITING_{PERMISSION,QUESTION,PLAN}
//!                      │  ▲                         │
//!                      │  └──────── Resume ─────────┘
//!                      │
//!                      ├── Complete ──▶ COMPLETED
//!   any non-terminal ──┼── Fail ──────▶ FAILED
//!                      └── Cancel ────▶ CANCELLED
//! ```
//!
//! `transition` and `dispatch` are pure; the orchestrator applies them under
//! the user's run-slot lock.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentEvent;
use crate::interaction::{InteractionKind, InteractionPrompt, InteractionRequest};
use crate::render::RenderUpdate;
use crate::session::{ContinuationHandle, ModeFlags, UserId};

/// Lifecycle state of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    WaitingPermission,
    WaitingQuestion,
    WaitingPlan,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    pub fn is_waiting(self) -> bool {
        self.waiting_for().is_some()
    }

    pub fn waiting_for(self) -> Option<InteractionKind> {
        match self {
            TaskState::WaitingPermission => Some(InteractionKind::Permission),
            TaskState::WaitingQuestion => Some(InteractionKind::Question),
            TaskState::WaitingPlan => Some(InteractionKind::Plan),
            _ => None,
        }
    }

    fn waiting(kind: InteractionKind) -> Self {
        match kind {
            InteractionKind::Permission => TaskState::WaitingPermission,
            InteractionKind::Question => TaskState::WaitingQuestion,
            InteractionKind::Plan => TaskState::WaitingPlan,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Idle => "IDLE",
            TaskState::Running => "RUNNING",
            TaskState::WaitingPermission => "WAITING_PERMISSION",
            TaskState::WaitingQuestion => "WAITING_QUESTION",
            TaskState::WaitingPlan => "WAITING_PLAN",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    Wait(InteractionKind),
    Resume,
    Complete,
    Fail,
    Cancel,
}

/// Next state, or `None` when the event is not valid in `state`
pub fn transition(state: TaskState, event: TaskEvent) -> Option<TaskState> {
    use TaskState::*;

    if state.is_terminal() {
        return None;
    }
    match (state, event) {
        (Idle, TaskEvent::Start) => Some(Running),
        (Running, TaskEvent::Wait(kind)) => Some(TaskState::waiting(kind)),
        (s, TaskEvent::Resume) if s.is_waiting() => Some(Running),
        (Running, TaskEvent::Complete) => Some(Completed),
        (_, TaskEvent::Fail) => Some(Failed),
        (_, TaskEvent::Cancel) => Some(Cancelled),
        _ => None,
    }
}

/// What the driver does with one agent event
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Render(RenderUpdate),
    ToolStarted {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolFinished {
        id: String,
        output: String,
        is_error: bool,
    },
    /// Pause and ask the user
    Interact(InteractionPrompt),
    /// Permission granted without asking
    AutoApprove { tool_name: String },
    Complete(Option<ContinuationHandle>),
    Fail(String),
}

/// Map an agent event to the driver's next step
pub fn dispatch(event: AgentEvent, flags: ModeFlags) -> Step {
    match event {
        AgentEvent::TextDelta { text } => Step::Render(RenderUpdate::Text(text)),
        AgentEvent::Thinking { .. } => Step::Render(RenderUpdate::Status("Thinking…".to_string())),
        AgentEvent::ToolStart { id, name, input } => Step::ToolStarted { id, name, input },
        AgentEvent::ToolResult {
            id,
            output,
            is_error,
        } => Step::ToolFinished {
            id,
            output,
            is_error,
        },
        AgentEvent::PermissionRequest { tool_name, .. } if flags.auto_approve => Step::AutoApprove { tool_name },
        AgentEvent::PermissionRequest {
            tool_name,
            arguments,
        } => Step::Interact(InteractionPrompt::Permission {
            tool_name,
            arguments,
        }),
        AgentEvent::QuestionRequest { question, options } => {
            Step::Interact(InteractionPrompt::Question { question, options })
        }
        AgentEvent::PlanRequest { plan } => Step::Interact(InteractionPrompt::Plan { plan }),
        AgentEvent::Error { message } => Step::Fail(message),
        AgentEvent::Done { continuation } => Step::Complete(continuation),
    }
}

/// Record of one turn, alive from acceptance until its terminal state
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub run_id: String,
    pub user_id: UserId,
    pub state: TaskState,
    pub started_at: Instant,
    pub cancel: CancellationToken,
    /// Request the turn is waiting on, if any
    pub interaction: Option<InteractionRequest>,
}

impl TaskRun {
    pub fn new(user_id: UserId) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            state: TaskState::Idle,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            interaction: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Read-only view for UI polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub elapsed: Duration,
    pub pending: Option<InteractionKind>,
}

impl TaskStatus {
    pub fn idle() -> Self {
        Self {
            state: TaskState::Idle,
            elapsed: Duration::ZERO,
            pending: None,
        }
    }
}

/// Broadcast once per turn when it reaches a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub user_id: UserId,
    pub run_id: String,
    pub state: TaskState,
    pub elapsed: Duration,
    /// Failure message for `FAILED`
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let running = transition(TaskState::Idle, TaskEvent::Start).unwrap();
        assert_eq!(running, TaskState::Running);

        let waiting = transition(running, TaskEvent::Wait(InteractionKind::Question)).unwrap();
        assert_eq!(waiting, TaskState::WaitingQuestion);
        assert_eq!(waiting.waiting_for(), Some(InteractionKind::Question));

        let resumed = transition(waiting, TaskEvent::Resume).unwrap();
        assert_eq!(transition(resumed, TaskEvent::Complete), Some(TaskState::Completed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(transition(TaskState::Idle, TaskEvent::Complete), None);
        assert_eq!(transition(TaskState::Running, TaskEvent::Resume), None);
        assert_eq!(
            transition(TaskState::WaitingPlan, TaskEvent::Wait(InteractionKind::Permission)),
            None
        );
        // Cannot complete while paused
        assert_eq!(transition(TaskState::WaitingPermission, TaskEvent::Complete), None);
    }

    #[test]
    fn test_terminal_states_absorb_everything() {
        for terminal in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
            assert!(terminal.is_terminal());
            for event in [TaskEvent::Start, TaskEvent::Resume, TaskEvent::Cancel, TaskEvent::Fail] {
                assert_eq!(transition(terminal, event), None);
            }
        }
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for state in [
            TaskState::Idle,
            TaskState::Running,
            TaskState::WaitingPermission,
            TaskState::WaitingQuestion,
            TaskState::WaitingPlan,
        ] {
            assert_eq!(transition(state, TaskEvent::Cancel), Some(TaskState::Cancelled));
        }
    }

    #[test]
    fn test_dispatch_permission_respects_auto_approve() {
        let event = AgentEvent::PermissionRequest {
            tool_name: "Write".into(),
            arguments: serde_json::json!({}),
        };
        assert!(matches!(dispatch(event.clone(), ModeFlags::default()), Step::Interact(_)));

        let flags = ModeFlags {
            auto_approve: true,
            ..ModeFlags::default()
        };
        assert_eq!(
            dispatch(event, flags),
            Step::AutoApprove {
                tool_name: "Write".into()
            }
        );
    }

    #[test]
    fn test_dispatch_terminal_events() {
        assert_eq!(
            dispatch(AgentEvent::Error { message: "boom".into() }, ModeFlags::default()),
            Step::Fail("boom".into())
        );
        assert_eq!(
            dispatch(AgentEvent::Done { continuation: None }, ModeFlags::default()),
            Step::Complete(None)
        );
        assert_eq!(
            dispatch(AgentEvent::TextDelta { text: "hi".into() }, ModeFlags::default()),
            Step::Render(RenderUpdate::Text("hi".into()))
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TaskState::WaitingPermission.to_string(), "WAITING_PERMISSION");
    }
}
