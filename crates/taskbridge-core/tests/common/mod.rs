//! Fakes for the engine's collaborators: a scripted agent and a transport
//! that records every call.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskbridge_core::{
    AgentBackend, AgentEvent, AgentTurn, ChatTransport, Config, Engine, InteractionRequest, MemorySessionRepository,
    MessageHandle, OutboundText, PersistedSession, ResumeValue, Result, SessionRepository, TransportError,
    TurnRequest, UserId,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One step of a scripted turn
#[derive(Debug, Clone)]
pub enum Scripted {
    Emit(AgentEvent),
    Sleep(Duration),
    /// Never produce another event
    Hang,
}

pub fn emit(event: AgentEvent) -> Scripted {
    Scripted::Emit(event)
}

pub fn text(text: &str) -> Scripted {
    Scripted::Emit(AgentEvent::TextDelta { text: text.to_string() })
}

pub fn done() -> Scripted {
    Scripted::Emit(AgentEvent::Done { continuation: None })
}

pub fn done_with(continuation: &str) -> Scripted {
    Scripted::Emit(AgentEvent::Done {
        continuation: Some(taskbridge_core::ContinuationHandle::new(continuation)),
    })
}

/// Agent that plays back one queued script per turn
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: Mutex<VecDeque<Vec<Scripted>>>,
    requests: Mutex<Vec<TurnRequest>>,
    resumes: Arc<Mutex<Vec<ResumeValue>>>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, steps: Vec<Scripted>) {
        self.scripts.lock().push_back(steps);
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }

    pub fn resumes(&self) -> Vec<ResumeValue> {
        self.resumes.lock().clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for ScriptedAgent {
    async fn start_turn(&self, request: TurnRequest) -> Result<Box<dyn AgentTurn>> {
        self.requests.lock().push(request);
        let steps = self.scripts.lock().pop_front().unwrap_or_else(|| vec![done()]);
        Ok(Box::new(ScriptedTurn {
            steps: steps.into(),
            sleeping_until: None,
            resumes: self.resumes.clone(),
            cancelled: self.cancelled.clone(),
        }))
    }
}

struct ScriptedTurn {
    steps: VecDeque<Scripted>,
    sleeping_until: Option<Instant>,
    resumes: Arc<Mutex<Vec<ResumeValue>>>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl AgentTurn for ScriptedTurn {
    async fn next_event(&mut self) -> Option<Result<AgentEvent>> {
        loop {
            // Keep the deadline across cancelled polls
            if let Some(until) = self.sleeping_until {
                tokio::time::sleep_until(until).await;
                self.sleeping_until = None;
            }
            match self.steps.front().cloned() {
                Some(Scripted::Emit(event)) => {
                    self.steps.pop_front();
                    return Some(Ok(event));
                }
                Some(Scripted::Sleep(duration)) => {
                    self.steps.pop_front();
                    self.sleeping_until = Some(Instant::now() + duration);
                }
                Some(Scripted::Hang) => std::future::pending::<()>().await,
                None => return None,
            }
        }
    }

    async fn resume(&mut self, value: ResumeValue) -> Result<()> {
        self.resumes.lock().push(value);
        Ok(())
    }

    async fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A transport call as seen by the chat service
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Send { message_id: i64, body: String },
    Edit { message_id: i64, body: String },
    Delete { message_id: i64 },
    Present { message_id: i64, request: InteractionRequest },
}

/// Transport that records calls and keeps the latest text of every message
pub struct RecordingTransport {
    next_id: AtomicI64,
    calls: Mutex<Vec<Call>>,
    texts: Mutex<HashMap<i64, String>>,
    limit: Option<usize>,
    /// Reject every edit with this retry delay
    edit_rate_limit: Mutex<Option<Duration>>,
    interactions_tx: mpsc::UnboundedSender<InteractionRequest>,
    interactions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InteractionRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Self::with_limit(None)
    }

    pub fn with_limit(limit: Option<usize>) -> Arc<Self> {
        let (interactions_tx, interactions_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            calls: Mutex::new(Vec::new()),
            texts: Mutex::new(HashMap::new()),
            limit,
            edit_rate_limit: Mutex::new(None),
            interactions_tx,
            interactions_rx: tokio::sync::Mutex::new(interactions_rx),
        })
    }

    /// Answer every edit from now on with `RateLimited { retry_after }`
    pub fn rate_limit_edits(&self, retry_after: Duration) {
        *self.edit_rate_limit.lock() = Some(retry_after);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Latest text of a message
    pub fn text(&self, message_id: i64) -> Option<String> {
        self.texts.lock().get(&message_id).cloned()
    }

    /// Every body ever sent or written by an edit
    pub fn bodies(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Send { body, .. } | Call::Edit { body, .. } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<i64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Delete { message_id } => Some(*message_id),
                _ => None,
            })
            .collect()
    }

    /// Wait until the engine presents an interaction
    pub async fn next_interaction(&self) -> InteractionRequest {
        self.interactions_rx
            .lock()
            .await
            .recv()
            .await
            .expect("transport dropped")
    }

    fn allocate(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    fn max_message_len(&self) -> Option<usize> {
        self.limit
    }

    async fn send(&self, user_id: UserId, text: &OutboundText) -> std::result::Result<MessageHandle, TransportError> {
        let message_id = self.allocate();
        self.texts.lock().insert(message_id, text.body.clone());
        self.calls.lock().push(Call::Send {
            message_id,
            body: text.body.clone(),
        });
        Ok(MessageHandle::new(user_id, message_id))
    }

    async fn edit(&self, handle: &MessageHandle, text: &OutboundText) -> std::result::Result<(), TransportError> {
        if let Some(retry_after) = *self.edit_rate_limit.lock() {
            return Err(TransportError::RateLimited { retry_after });
        }
        self.texts.lock().insert(handle.message_id, text.body.clone());
        self.calls.lock().push(Call::Edit {
            message_id: handle.message_id,
            body: text.body.clone(),
        });
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> std::result::Result<(), TransportError> {
        self.texts.lock().remove(&handle.message_id);
        self.calls.lock().push(Call::Delete {
            message_id: handle.message_id,
        });
        Ok(())
    }

    async fn present_interaction(
        &self,
        user_id: UserId,
        request: &InteractionRequest,
    ) -> std::result::Result<MessageHandle, TransportError> {
        let message_id = self.allocate();
        self.calls.lock().push(Call::Present {
            message_id,
            request: request.clone(),
        });
        let _ = self.interactions_tx.send(request.clone());
        Ok(MessageHandle::new(user_id, message_id))
    }
}

/// Repository whose loads take a while, like one on a slow disk
#[derive(Default)]
pub struct SlowRepository {
    inner: MemorySessionRepository,
    delay: Duration,
}

impl SlowRepository {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySessionRepository::new(),
            delay,
        })
    }
}

#[async_trait]
impl SessionRepository for SlowRepository {
    async fn load(&self, user_id: UserId) -> Result<Option<PersistedSession>> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(user_id).await
    }

    async fn save(&self, session: &PersistedSession) -> Result<()> {
        self.inner.save(session).await
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        self.inner.delete(user_id).await
    }
}

/// Engine over fresh fakes
pub fn harness(config: Config) -> (Engine, Arc<RecordingTransport>, Arc<ScriptedAgent>) {
    let transport = RecordingTransport::new();
    let agent = ScriptedAgent::new();
    let engine = Engine::new(&config, transport.clone(), agent.clone());
    (engine, transport, agent)
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.default_working_dir = std::env::temp_dir();
    config
}
