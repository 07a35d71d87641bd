//! TaskBridge Core - per-user task orchestration for chat-driven coding agents
//!
//! This crate provides the engine behind the chat front-end:
//! - Session Store: copy-on-write per-user session snapshots
//! - Interaction Broker: one outstanding permission/question/plan request per user
//! - Update Renderer: debounced, split, well-formed streaming output
//! - Input Coalescer: merges rapid consecutive messages into one input
//! - Task Orchestrator: the turn state machine tying them together

pub mod agent;
pub mod coalesce;
pub mod config;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod orchestrator;
pub mod partition;
pub mod render;
pub mod session;
pub mod transport;

pub use agent::{AgentBackend, AgentEvent, AgentTurn, ProcessAgent, ResumeValue, TurnRequest};
pub use coalesce::{BatchSink, CancelOutcome, CoalescedBatch, InputCoalescer, Settlement};
pub use config::{Config, ConfigManager};
pub use engine::Engine;
pub use error::{Error, Result, TransportError};
pub use interaction::{
    InteractionBroker, InteractionKind, InteractionPrompt, InteractionRequest, InteractionResponse, PlanDecision,
    QuestionOption, RequestHandle, WaitOutcome,
};
pub use orchestrator::{TaskOrchestrator, TaskState, TaskStatus, TurnReport};
pub use render::{RenderTarget, RenderUpdate, TerminalMark, ToolEvent, UpdateRenderer};
pub use session::{
    ContinuationHandle, JsonSessionRepository, MemorySessionRepository, ModeFlags, PersistedSession,
    SessionRepository, SessionStore, Snapshot, UserId, UserSession,
};
pub use transport::{ChatTransport, MessageHandle, OutboundText, TextFormat};
