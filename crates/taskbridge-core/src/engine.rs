//! Engine facade - what the bot/UI layer talks to
//!
//! Wires the components together:
//!
//! ```text
//!   submit_input ──▶ InputCoalescer ──(batch)──▶ TaskOrchestrator::accept
//!   respond_*    ──▶ TaskOrchestrator ──▶ InteractionBroker
//!   cancel       ──▶ InputCoalescer::discard + TaskOrchestrator::cancel
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::agent::AgentBackend;
use crate::coalesce::{BatchSink, CoalescedBatch, InputCoalescer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::interaction::{InteractionBroker, InteractionRequest, PlanDecision};
use crate::orchestrator::{TaskOrchestrator, TaskStatus, TurnReport};
use crate::render::UpdateRenderer;
use crate::session::{ModeFlags, SessionRepository, SessionStore, Snapshot, UserId, UserSession};
use crate::transport::{ChatTransport, OutboundText};

/// Hands closed batches to the orchestrator
struct TurnLauncher {
    orchestrator: Arc<TaskOrchestrator>,
    transport: Arc<dyn ChatTransport>,
    separator: String,
}

#[async_trait]
impl BatchSink for TurnLauncher {
    async fn deliver(&self, batch: CoalescedBatch) {
        let user_id = batch.user_id;
        let text = batch.combined_text(&self.separator);
        debug!(user_id, inputs = batch.inputs.len(), "Delivering coalesced input");

        match self.orchestrator.accept(user_id, text) {
            Ok(_) => {}
            Err(Error::Busy { .. }) => {
                info!(user_id, "Batch arrived while a turn is running");
                let notice = OutboundText::html(
                    "⏳ <i>Still working on the previous request. Your message was not started.</i>",
                );
                if let Err(e) = self.transport.send(user_id, &notice).await {
                    warn!(user_id, error = %e, "Failed to send busy notice");
                }
            }
            Err(e) => warn!(user_id, error = %e, "Failed to start turn"),
        }
    }
}

/// The engine as seen from the chat layer
pub struct Engine {
    orchestrator: Arc<TaskOrchestrator>,
    coalescer: InputCoalescer,
}

impl Engine {
    pub fn new(config: &Config, transport: Arc<dyn ChatTransport>, agent: Arc<dyn AgentBackend>) -> Self {
        Self::build(config, transport, agent, None)
    }

    /// Engine that hydrates sessions from, and saves them to, a repository
    pub fn with_repository(
        config: &Config,
        transport: Arc<dyn ChatTransport>,
        agent: Arc<dyn AgentBackend>,
        repository: Arc<dyn SessionRepository>,
    ) -> Self {
        Self::build(config, transport, agent, Some(repository))
    }

    fn build(
        config: &Config,
        transport: Arc<dyn ChatTransport>,
        agent: Arc<dyn AgentBackend>,
        repository: Option<Arc<dyn SessionRepository>>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.session.default_working_dir.clone()));
        let broker = Arc::new(InteractionBroker::new());
        let renderer = UpdateRenderer::new(transport.clone(), config.render.clone());

        let mut orchestrator = TaskOrchestrator::new(sessions, broker, renderer, agent, config.interaction.clone());
        if let Some(repository) = repository {
            orchestrator = orchestrator.with_repository(repository);
        }
        let orchestrator = Arc::new(orchestrator);

        let launcher = Arc::new(TurnLauncher {
            orchestrator: orchestrator.clone(),
            transport,
            separator: config.coalesce.separator.clone(),
        });
        let coalescer = InputCoalescer::new(launcher, config.coalesce.clone());

        Self {
            orchestrator,
            coalescer,
        }
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn coalescer(&self) -> &InputCoalescer {
        &self.coalescer
    }

    /// Queue user input; it starts a turn once the coalescing window closes
    pub fn submit_input(&self, user_id: UserId, text: impl Into<String>) -> Result<()> {
        if self.orchestrator.is_busy(user_id) {
            return Err(Error::Busy { user_id });
        }
        self.coalescer.submit(user_id, text);
        Ok(())
    }

    /// Start the queued input now instead of waiting out the window
    pub async fn flush_input(&self, user_id: UserId) -> bool {
        self.coalescer.cancel_and_flush(user_id).await
    }

    pub fn respond_permission(&self, user_id: UserId, approved: bool, clarification: Option<String>) -> Result<()> {
        self.orchestrator.respond_permission(user_id, approved, clarification)
    }

    pub fn respond_question(&self, user_id: UserId, answer: impl Into<String>) -> Result<()> {
        self.orchestrator.respond_question(user_id, answer)
    }

    pub fn respond_plan(&self, user_id: UserId, decision: PlanDecision) -> Result<()> {
        self.orchestrator.respond_plan(user_id, decision)
    }

    /// Cancel queued input and the running turn
    ///
    /// Returns whether anything was cancelled.
    pub async fn cancel(&self, user_id: UserId) -> bool {
        let discarded = self.coalescer.discard(user_id).await.is_some();
        let cancelled = self.orchestrator.cancel(user_id);
        if discarded {
            debug!(user_id, "Discarded queued input");
        }
        discarded || cancelled
    }

    /// Drop all queued input and cancel every live turn
    ///
    /// Returns the number of turns cancelled.
    pub async fn shutdown(&self) -> usize {
        let queued = self.coalescer.queued_users();
        let discarded = join_all(queued.into_iter().map(|user_id| self.coalescer.discard(user_id))).await;
        let cancelled = self
            .orchestrator
            .active_users()
            .into_iter()
            .filter(|&user_id| self.orchestrator.cancel(user_id))
            .count();
        info!(
            discarded = discarded.iter().flatten().count(),
            cancelled, "Engine shut down"
        );
        cancelled
    }

    pub fn status(&self, user_id: UserId) -> TaskStatus {
        self.orchestrator.status(user_id)
    }

    /// The interaction the user's turn is waiting on
    pub fn pending_interaction(&self, user_id: UserId) -> Option<InteractionRequest> {
        self.orchestrator.broker().pending(user_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnReport> {
        self.orchestrator.subscribe()
    }

    /// Current session snapshot
    pub async fn session(&self, user_id: UserId) -> Snapshot {
        self.orchestrator.hydrate(user_id).await
    }

    /// Change the working directory; the continuation is dropped with it
    pub async fn set_working_directory(&self, user_id: UserId, dir: impl Into<PathBuf>) -> Result<Snapshot> {
        let dir = dir.into();
        self.update_session(user_id, move |session| session.with_working_directory(dir))
            .await
    }

    /// Forget the continuation so the next turn starts a fresh conversation
    pub async fn new_session(&self, user_id: UserId) -> Result<Snapshot> {
        self.update_session(user_id, |session| session.with_continuation(None))
            .await
    }

    pub async fn set_auto_approve(&self, user_id: UserId, enabled: bool) -> Result<Snapshot> {
        self.update_session(user_id, move |session| {
            session.with_flags(ModeFlags {
                auto_approve: enabled,
                ..session.flags
            })
        })
        .await
    }

    pub async fn set_brief_output(&self, user_id: UserId, enabled: bool) -> Result<Snapshot> {
        self.update_session(user_id, move |session| {
            session.with_flags(ModeFlags {
                brief_output: enabled,
                ..session.flags
            })
        })
        .await
    }

    async fn update_session<F>(&self, user_id: UserId, mutator: F) -> Result<Snapshot>
    where
        F: FnOnce(&UserSession) -> UserSession + Send,
    {
        if self.orchestrator.is_busy(user_id) {
            return Err(Error::Busy { user_id });
        }
        self.orchestrator.hydrate(user_id).await;
        // A turn may have started while the session loaded
        let snapshot = self
            .orchestrator
            .with_idle(user_id, || self.orchestrator.sessions().replace(user_id, mutator))?;
        self.orchestrator.persist(&snapshot).await;
        Ok(snapshot)
    }
}
