//! Task Orchestrator - one agent turn per user at a time
//!
//! ## Architecture
//!
//! ```text
//!   accept(user, input) ──▶ run slot (Busy if live) ──▶ spawn driver task
//!
//!   driver:  start_turn ──▶ loop select! {
//!                             cancel token        → CANCELLED
//!                             render flush timer  → flush_if_due
//!                             agent next_event    → dispatch(event) → Step
//!                           }
//!            Step::Interact ──▶ broker.open ──▶ WAITING_* ──▶ await_response
//!                               (timeout → declined)  ──▶ resume ──▶ RUNNING
//! ```
//!
//! Each turn runs in its own task; the only locks it takes are its own
//! user's slots, so users never wait on each other.

mod state;

pub use state::{Step, TaskEvent, TaskRun, TaskState, TaskStatus, TurnReport, dispatch, transition};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentBackend, AgentEvent, AgentTurn, ResumeValue, TurnRequest};
use crate::config::InteractionConfig;
use crate::error::{Error, Result};
use crate::interaction::{
    InteractionBroker, InteractionKind, InteractionPrompt, InteractionRequest, InteractionResponse, PlanDecision,
    WaitOutcome,
};
use crate::partition::UserPartition;
use crate::render::{RenderTarget, RenderUpdate, TerminalMark, ToolEvent, UpdateRenderer};
use crate::session::{
    ContinuationHandle, ModeFlags, PersistedSession, SessionRepository, SessionStore, Snapshot, UserId, UserSession,
};

/// Capacity of the turn report channel
const REPORT_CAPACITY: usize = 64;

#[derive(Default)]
struct RunSlot {
    run: Option<TaskRun>,
}

impl RunSlot {
    fn is_live(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.state.is_terminal())
    }
}

enum Outcome {
    Completed(Option<ContinuationHandle>),
    Failed(String),
    Cancelled,
}

enum Wake {
    Cancelled,
    Flush,
    Event(Option<Result<AgentEvent>>),
}

/// Runs agent turns and mediates their interactive pauses
pub struct TaskOrchestrator {
    runs: UserPartition<RunSlot>,
    sessions: Arc<SessionStore>,
    broker: Arc<InteractionBroker>,
    renderer: UpdateRenderer,
    agent: Arc<dyn AgentBackend>,
    repository: Option<Arc<dyn SessionRepository>>,
    timeouts: InteractionConfig,
    reports: broadcast::Sender<TurnReport>,
}

impl TaskOrchestrator {
    pub fn new(
        sessions: Arc<SessionStore>,
        broker: Arc<InteractionBroker>,
        renderer: UpdateRenderer,
        agent: Arc<dyn AgentBackend>,
        timeouts: InteractionConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            runs: UserPartition::new(),
            sessions,
            broker,
            renderer,
            agent,
            repository: None,
            timeouts,
            reports,
        }
    }

    /// Read preferences from, and write continuations to, a repository
    pub fn with_repository(mut self, repository: Arc<dyn SessionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn broker(&self) -> &Arc<InteractionBroker> {
        &self.broker
    }

    pub fn renderer(&self) -> &UpdateRenderer {
        &self.renderer
    }

    /// Terminal reports for every turn from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TurnReport> {
        self.reports.subscribe()
    }

    /// Start a turn for the user, or fail with `Busy` if one is live
    ///
    /// Returns the new run id.
    pub fn accept(self: &Arc<Self>, user_id: UserId, input: impl Into<String>) -> Result<String> {
        let accepted = self.runs.with(user_id, |slot| {
            if slot.is_live() {
                return Err(Error::Busy { user_id });
            }
            let mut run = TaskRun::new(user_id);
            run.state = transition(run.state, TaskEvent::Start).unwrap_or(TaskState::Running);
            slot.run = Some(run.clone());
            Ok(run)
        });
        let run = match accepted {
            Ok(run) => run,
            Err(e) => {
                debug!(user_id, "Input rejected, turn already running");
                return Err(e);
            }
        };

        info!(user_id, run_id = %run.run_id, "Turn accepted");
        let run_id = run.run_id.clone();
        let this = self.clone();
        let input = input.into();
        tokio::spawn(async move { this.drive(run, input).await });
        Ok(run_id)
    }

    pub fn is_busy(&self, user_id: UserId) -> bool {
        self.runs.existing(user_id).is_some_and(|slot| slot.lock().is_live())
    }

    /// Run `f` while holding off new turns for the user
    ///
    /// Fails with `Busy` if a turn is live. `accept` takes the same slot
    /// lock, so no turn can start until `f` returns. `f` must not block.
    pub fn with_idle<R>(&self, user_id: UserId, f: impl FnOnce() -> R) -> Result<R> {
        let result = self.runs.with(user_id, |slot| {
            if slot.is_live() {
                return Err(Error::Busy { user_id });
            }
            Ok(f())
        });
        self.runs.remove_if(user_id, |slot| slot.run.is_none());
        result
    }

    /// Users with a live turn
    pub fn active_users(&self) -> Vec<UserId> {
        self.runs.users().into_iter().filter(|&user_id| self.is_busy(user_id)).collect()
    }

    /// Current state of the user's turn
    pub fn status(&self, user_id: UserId) -> TaskStatus {
        let Some(slot) = self.runs.existing(user_id) else {
            return TaskStatus::idle();
        };
        let slot = slot.lock();
        match &slot.run {
            Some(run) => TaskStatus {
                state: run.state,
                elapsed: run.elapsed(),
                pending: run.interaction.as_ref().map(|r| r.kind()),
            },
            None => TaskStatus::idle(),
        }
    }

    pub fn respond_permission(&self, user_id: UserId, approved: bool, clarification: Option<String>) -> Result<()> {
        self.respond(
            user_id,
            InteractionResponse::Permission {
                approved,
                clarification,
            },
        )
    }

    pub fn respond_question(&self, user_id: UserId, answer: impl Into<String>) -> Result<()> {
        self.respond(user_id, InteractionResponse::Question { answer: answer.into() })
    }

    pub fn respond_plan(&self, user_id: UserId, decision: PlanDecision) -> Result<()> {
        self.respond(user_id, InteractionResponse::Plan { decision })
    }

    fn respond(&self, user_id: UserId, response: InteractionResponse) -> Result<()> {
        self.broker.respond(user_id, response).inspect_err(|e| {
            error!(user_id, error = %e, "Interaction response rejected");
        })
    }

    /// Cancel the user's live turn
    ///
    /// Returns whether there was one. The turn reaches `CANCELLED` in its
    /// own task, after finalizing its output.
    pub fn cancel(&self, user_id: UserId) -> bool {
        let token = self.runs.with(user_id, |slot| {
            slot.run
                .as_ref()
                .filter(|run| !run.state.is_terminal())
                .map(|run| run.cancel.clone())
        });
        match token {
            Some(token) => {
                info!(user_id, "Cancelling turn");
                token.cancel();
                self.broker.cancel(user_id);
                true
            }
            None => false,
        }
    }

    /// The user's session, loading stored preferences on first use
    pub async fn hydrate(&self, user_id: UserId) -> Snapshot {
        let current = self.sessions.get_or_create(user_id);
        if current.hydrated {
            return current;
        }

        let stored = match &self.repository {
            Some(repository) => match repository.load(user_id).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(user_id, error = %e, "Failed to load stored session, using defaults");
                    None
                }
            },
            None => None,
        };
        if stored.is_some() {
            debug!(user_id, "Hydrated session from repository");
        }

        self.sessions.replace(user_id, |session| {
            if session.hydrated {
                session.clone()
            } else {
                session.hydrated_from(stored.as_ref())
            }
        })
    }

    /// Write the session back to the repository; failures are only logged
    pub async fn persist(&self, session: &UserSession) {
        let Some(repository) = &self.repository else {
            return;
        };
        if let Err(e) = repository.save(&PersistedSession::from(session)).await {
            warn!(user_id = session.user_id, error = %e, "Failed to persist session");
        }
    }

    fn timeout_for(&self, kind: InteractionKind) -> Duration {
        match kind {
            InteractionKind::Permission => self.timeouts.permission_timeout(),
            InteractionKind::Question => self.timeouts.question_timeout(),
            InteractionKind::Plan => self.timeouts.plan_timeout(),
        }
    }

    /// Apply a state machine event to the user's run, if it is still `run_id`
    fn apply(
        &self,
        user_id: UserId,
        run_id: &str,
        event: TaskEvent,
        interaction: Option<InteractionRequest>,
    ) -> Option<TaskState> {
        self.runs.with(user_id, |slot| {
            let run = slot.run.as_mut().filter(|run| run.run_id == run_id)?;
            let Some(next) = transition(run.state, event) else {
                warn!(user_id, run_id, state = %run.state, ?event, "Ignoring invalid transition");
                return None;
            };
            debug!(user_id, run_id, from = %run.state, to = %next, "State transition");
            run.state = next;
            run.interaction = interaction;
            if next.is_terminal() {
                slot.run = None;
            }
            Some(next)
        })
    }

    /// Drop the run record regardless of its state
    fn release(&self, user_id: UserId, run_id: &str) {
        self.runs.with(user_id, |slot| {
            if slot.run.as_ref().is_some_and(|run| run.run_id == run_id) {
                warn!(user_id, run_id, "Releasing run slot without a terminal transition");
                slot.run = None;
            }
        });
    }

    async fn drive(self: Arc<Self>, run: TaskRun, input: String) {
        let TaskRun {
            run_id,
            user_id,
            started_at,
            cancel,
            ..
        } = run;

        let session = self.hydrate(user_id).await;
        let mut target = self.renderer.start_for_turn(user_id, cancel.clone()).await;
        target.set_brief_output(session.flags.brief_output);
        let handle = target.primary_handle().cloned();
        self.sessions.replace(user_id, |s| s.with_render_target(handle));

        let started_in = session.working_directory.clone();
        let request = TurnRequest {
            user_id,
            input,
            working_directory: started_in.clone(),
            continuation: session.continuation.clone(),
        };

        let mut turn = TurnContext {
            orchestrator: self.as_ref(),
            user_id,
            run_id: run_id.clone(),
            cancel,
            flags: session.flags,
            target,
            seq: 0,
            tools: HashMap::new(),
        };
        let outcome = turn.run(request).await;
        let mut target = turn.target;

        let (event, mark, error_message) = match &outcome {
            Outcome::Completed(_) => (TaskEvent::Complete, TerminalMark::Completed, None),
            Outcome::Failed(message) => {
                error!(user_id, run_id = %run_id, error = %message, "Turn failed");
                (TaskEvent::Fail, TerminalMark::Failed(message.clone()), Some(message.clone()))
            }
            Outcome::Cancelled => (TaskEvent::Cancel, TerminalMark::Cancelled, None),
        };
        target.finalize_with(mark).await;

        match outcome {
            Outcome::Completed(continuation) => {
                // A continuation only resumes in the directory it was made in
                let snapshot = self.sessions.replace(user_id, |s| {
                    let s = s.with_render_target(None);
                    match continuation {
                        Some(continuation) if s.working_directory == started_in => {
                            s.with_continuation(Some(continuation))
                        }
                        Some(_) => {
                            warn!(user_id, run_id = %run_id, "Working directory changed during the turn, dropping continuation");
                            s
                        }
                        None => s,
                    }
                });
                self.persist(&snapshot).await;
            }
            _ => {
                self.sessions.replace(user_id, |s| s.with_render_target(None));
            }
        }

        let state = match self.apply(user_id, &run_id, event, None) {
            Some(state) => state,
            None => {
                self.release(user_id, &run_id);
                match event {
                    TaskEvent::Complete => TaskState::Completed,
                    TaskEvent::Cancel => TaskState::Cancelled,
                    _ => TaskState::Failed,
                }
            }
        };
        self.runs.remove_if(user_id, |slot| slot.run.is_none());

        let elapsed = started_at.elapsed();
        info!(user_id, run_id = %run_id, state = %state, elapsed_ms = elapsed.as_millis() as u64, "Turn finished");
        let _ = self.reports.send(TurnReport {
            user_id,
            run_id,
            state,
            elapsed,
            error: error_message,
        });
    }
}

/// State of one running turn, owned by its driver task
struct TurnContext<'a> {
    orchestrator: &'a TaskOrchestrator,
    user_id: UserId,
    run_id: String,
    cancel: CancellationToken,
    flags: ModeFlags,
    target: RenderTarget,
    seq: u64,
    /// Tool names by call id, for results
    tools: HashMap<String, String>,
}

impl TurnContext<'_> {
    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn render(&mut self, update: RenderUpdate) {
        let seq = self.next_seq();
        self.target.append(seq, update);
    }

    fn tool(&mut self, event: ToolEvent) {
        let seq = self.next_seq();
        self.target.on_tool_event(seq, event);
    }

    async fn run(&mut self, request: TurnRequest) -> Outcome {
        let orchestrator = self.orchestrator;
        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            started = orchestrator.agent.start_turn(request) => started,
        };
        let mut turn = match started {
            Ok(turn) => turn,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        let outcome = self.pump(turn.as_mut()).await;
        if !matches!(outcome, Outcome::Completed(_)) {
            turn.cancel().await;
        }
        outcome
    }

    async fn pump(&mut self, turn: &mut dyn AgentTurn) -> Outcome {
        loop {
            let deadline = self.target.next_flush_deadline();
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = flush_timer(deadline) => Wake::Flush,
                event = turn.next_event() => Wake::Event(event),
            };

            let event = match wake {
                Wake::Cancelled => return Outcome::Cancelled,
                Wake::Flush => {
                    self.target.flush_if_due().await;
                    continue;
                }
                Wake::Event(None) => {
                    return Outcome::Failed("Agent stream ended without finishing the turn".to_string());
                }
                Wake::Event(Some(Err(e))) => return Outcome::Failed(e.to_string()),
                Wake::Event(Some(Ok(event))) => event,
            };
            debug!(user_id = self.user_id, run_id = %self.run_id, event = event.name(), "Agent event");

            match dispatch(event, self.flags) {
                Step::Render(update) => self.render(update),
                Step::ToolStarted { id, name, input } => {
                    self.tools.insert(id, name.clone());
                    self.tool(ToolEvent::Started { name, input });
                }
                Step::ToolFinished {
                    id,
                    output,
                    is_error,
                } => {
                    let name = self.tools.remove(&id).unwrap_or(id);
                    self.tool(ToolEvent::Finished {
                        name,
                        is_error,
                        output,
                    });
                }
                Step::AutoApprove { tool_name } => {
                    info!(user_id = self.user_id, tool = %tool_name, "Permission auto-approved");
                    let value = ResumeValue::Permission {
                        approved: true,
                        clarification: None,
                    };
                    if let Err(e) = turn.resume(value).await {
                        return Outcome::Failed(e.to_string());
                    }
                }
                Step::Interact(prompt) => {
                    let response = match self.interact(prompt).await {
                        Ok(response) => response,
                        Err(Error::Cancelled) => return Outcome::Cancelled,
                        Err(e) => return Outcome::Failed(e.to_string()),
                    };
                    self.render(RenderUpdate::Status("Working…".to_string()));
                    if let Err(e) = turn.resume(response.into()).await {
                        return Outcome::Failed(e.to_string());
                    }
                }
                Step::Complete(continuation) => return Outcome::Completed(continuation),
                Step::Fail(message) => return Outcome::Failed(message),
            }
        }
    }

    /// Pause the turn on the broker until the user answers, the wait times
    /// out, or the turn is cancelled
    async fn interact(&mut self, prompt: InteractionPrompt) -> Result<InteractionResponse> {
        let orchestrator = self.orchestrator;
        let user_id = self.user_id;
        let kind = prompt.kind();

        let handle = orchestrator.broker.open(user_id, prompt)?;
        let request = handle.request().clone();
        orchestrator.apply(user_id, &self.run_id, TaskEvent::Wait(kind), Some(request.clone()));
        self.render(RenderUpdate::Status(format!("Waiting for {} response", kind)));

        let transport = orchestrator.renderer.transport().clone();
        let presented = match transport.present_interaction(user_id, &request).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(user_id, kind = %kind, error = %e, "Failed to present interaction");
                None
            }
        };

        let wait = orchestrator.broker.await_response(handle, orchestrator.timeout_for(kind));
        tokio::pin!(wait);
        let outcome = loop {
            let deadline = self.target.next_flush_deadline();
            tokio::select! {
                biased;
                outcome = &mut wait => break outcome,
                _ = self.cancel.cancelled() => break WaitOutcome::Cancelled,
                _ = flush_timer(deadline) => {}
            }
            self.target.flush_if_due().await;
        };

        if let Some(handle) = presented
            && let Err(e) = transport.delete(&handle).await
        {
            debug!(user_id, error = %e, "Failed to remove interaction prompt");
        }

        match outcome {
            WaitOutcome::Responded(response) => {
                info!(user_id, kind = %kind, "Interaction answered");
                orchestrator.apply(user_id, &self.run_id, TaskEvent::Resume, None);
                Ok(response)
            }
            WaitOutcome::TimedOut => {
                self.render(RenderUpdate::Notice(format!(
                    "⌛ _No {} response in time, continuing as declined._",
                    kind
                )));
                orchestrator.apply(user_id, &self.run_id, TaskEvent::Resume, None);
                Ok(InteractionResponse::declined(kind))
            }
            WaitOutcome::Cancelled => {
                orchestrator.broker.cancel(user_id);
                Err(Error::Cancelled)
            }
        }
    }
}

/// Fires at the render deadline, or never when nothing is pending
async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
