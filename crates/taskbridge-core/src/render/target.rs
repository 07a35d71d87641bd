//! Update Renderer - streams a turn's output into chat messages
//!
//! ## Flow
//!
//! ```text
//! agent events ──append(seq, ..)──▶ reorder ──▶ RenderBuffer ──flush──▶ transport
//!                                    (by seq)     (parts)       (debounced)
//! ```
//!
//! - One outbound message per part; part 0 is the placeholder sent by
//!   [`UpdateRenderer::start`]
//! - A flush edits every part whose rendered text changed since it was last
//!   shown, and sends messages for new parts
//! - Flushes happen at most once per debounce interval; `finalize` flushes
//!   immediately
//! - Transport errors never escape: rate limits are waited out (or deferred
//!   with the content kept pending), rejected markup is retried as plain
//!   text, and a vanished message is replaced by a new one
//! - Rate-limit waits end as soon as the turn's cancel token fires; after
//!   that every flush makes a single attempt per part

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::buffer::RenderBuffer;
use super::markup::{self, Flavor};
use crate::config::{RenderConfig, MIN_BUDGET};
use crate::error::TransportError;
use crate::session::UserId;
use crate::transport::{ChatTransport, MessageHandle, OutboundText};

/// Escaped status lines are cut to this many characters
const STATUS_MAX_CHARS: usize = 60;

/// Content update for a render target
#[derive(Debug, Clone, PartialEq)]
pub enum RenderUpdate {
    /// Markdown text appended to the output
    Text(String),
    /// Markdown appended on a line of its own
    Notice(String),
    /// Replace the transient status line
    Status(String),
    /// Remove the transient status line
    ClearStatus,
}

/// Tool activity reported by the agent
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Started {
        name: String,
        input: serde_json::Value,
    },
    Finished {
        name: String,
        is_error: bool,
        output: String,
    },
}

/// How a turn ended, shown as the last line of the output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalMark {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
enum Item {
    Update(RenderUpdate),
    Tool(ToolEvent),
}

/// Outbound message backing one part
#[derive(Debug, Default)]
struct PartMessage {
    handle: Option<MessageHandle>,
    /// Text last accepted by the transport (or given up on)
    shown: Option<String>,
}

enum Delivery {
    Done,
    /// Kept pending, retry on a later flush
    Deferred,
    /// Dropped this version after exhausting fallbacks
    Abandoned,
}

/// Creates render targets over a shared transport
#[derive(Clone)]
pub struct UpdateRenderer {
    transport: Arc<dyn ChatTransport>,
    config: RenderConfig,
}

impl UpdateRenderer {
    pub fn new(transport: Arc<dyn ChatTransport>, config: RenderConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Open a render target that is never cancelled
    pub async fn start(&self, user_id: UserId) -> RenderTarget {
        self.start_for_turn(user_id, CancellationToken::new()).await
    }

    /// Open a render target for a turn, sending the placeholder message
    ///
    /// Once `cancel` fires, rate-limit waits are cut short.
    pub async fn start_for_turn(&self, user_id: UserId, cancel: CancellationToken) -> RenderTarget {
        let transport_limit = self.transport.max_message_len();
        if transport_limit.is_some_and(|limit| limit < RenderConfig::MIN_MESSAGE_LEN) {
            warn!(user_id, ?transport_limit, min_budget = MIN_BUDGET, "Transport limit leaves no room for message chrome");
        }
        let budget = self.config.body_budget(transport_limit);

        let mut target = RenderTarget {
            user_id,
            transport: self.transport.clone(),
            config: self.config.clone(),
            cancel,
            buffer: RenderBuffer::new(budget),
            messages: vec![PartMessage::default()],
            status: Some("Working…".to_string()),
            held: BTreeMap::new(),
            next_seq: 0,
            dirty: true,
            last_flush: None,
            backoff_until: None,
            brief: false,
            finalized: false,
        };
        target.flush_now().await;
        target
    }
}

/// Rendering state for one turn
pub struct RenderTarget {
    user_id: UserId,
    transport: Arc<dyn ChatTransport>,
    config: RenderConfig,
    cancel: CancellationToken,
    buffer: RenderBuffer,
    messages: Vec<PartMessage>,
    status: Option<String>,
    /// Updates that arrived ahead of a gap in the sequence
    held: BTreeMap<u64, Item>,
    next_seq: u64,
    dirty: bool,
    last_flush: Option<Instant>,
    backoff_until: Option<Instant>,
    brief: bool,
    finalized: bool,
}

impl RenderTarget {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Hide tool activity lines
    pub fn set_brief_output(&mut self, brief: bool) {
        self.brief = brief;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn part_count(&self) -> usize {
        self.buffer.part_count()
    }

    /// All text rendered so far, as markdown
    pub fn source(&self) -> String {
        self.buffer.source()
    }

    /// Handle of the first message, once it has been sent
    pub fn primary_handle(&self) -> Option<&MessageHandle> {
        self.messages.first().and_then(|m| m.handle.as_ref())
    }

    pub fn handles(&self) -> Vec<MessageHandle> {
        self.messages.iter().filter_map(|m| m.handle.clone()).collect()
    }

    /// Apply a content update carrying sequence number `seq`
    ///
    /// Updates are applied in sequence order; one that arrives early waits
    /// for the gap before it to fill, and a repeated number is ignored.
    pub fn append(&mut self, seq: u64, update: RenderUpdate) {
        self.accept(seq, Item::Update(update));
    }

    pub fn on_tool_event(&mut self, seq: u64, event: ToolEvent) {
        self.accept(seq, Item::Tool(event));
    }

    fn accept(&mut self, seq: u64, item: Item) {
        if self.finalized {
            debug!(user_id = self.user_id, seq, "Update after finalize ignored");
            return;
        }
        if seq < self.next_seq || self.held.contains_key(&seq) {
            debug!(user_id = self.user_id, seq, "Duplicate update dropped");
            return;
        }
        self.held.insert(seq, item);
        while let Some(item) = self.held.remove(&self.next_seq) {
            self.apply(item);
            self.next_seq += 1;
        }
    }

    fn apply(&mut self, item: Item) {
        match item {
            Item::Update(RenderUpdate::Text(text)) => self.push_text(&text),
            Item::Update(RenderUpdate::Notice(text)) => {
                let line = if text.ends_with('\n') { text } else { format!("{}\n", text) };
                self.push_line(&line);
            }
            Item::Update(RenderUpdate::Status(status)) => self.set_status(Some(status)),
            Item::Update(RenderUpdate::ClearStatus) => self.set_status(None),
            Item::Tool(ToolEvent::Started { name, input }) => {
                if !self.brief {
                    let detail = tool_summary(&input);
                    let line = match detail {
                        Some(detail) => format!(
                            "🔧 **{}** `{}`\n",
                            markup::escape_markdown(&name),
                            detail.replace('`', "'")
                        ),
                        None => format!("🔧 **{}**\n", markup::escape_markdown(&name)),
                    };
                    self.push_line(&line);
                }
                self.set_status(Some(format!("running {}", name)));
            }
            Item::Tool(ToolEvent::Finished {
                name,
                is_error,
                output,
            }) => {
                if is_error && !self.brief {
                    let reason = markup::truncate_chars(output.lines().next().unwrap_or(""), 120);
                    self.push_line(&format!(
                        "⚠️ {} failed: {}\n",
                        markup::escape_markdown(&name),
                        markup::escape_markdown(&reason)
                    ));
                }
                self.set_status(Some("Working…".to_string()));
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let opened = self.buffer.push(text);
        for _ in 0..opened {
            self.messages.push(PartMessage::default());
        }
        if opened > 0 {
            debug!(user_id = self.user_id, parts = self.buffer.part_count(), "Output split into new part");
        }
        self.dirty = true;
    }

    /// Append text that must start on its own line
    fn push_line(&mut self, line: &str) {
        if self.buffer.ends_with_newline() {
            self.push_text(line);
        } else {
            self.push_text(&format!("\n{}", line));
        }
    }

    fn set_status(&mut self, status: Option<String>) {
        if self.status != status {
            self.status = status;
            self.dirty = true;
        }
    }

    /// When the next flush is allowed, if there is anything to flush
    pub fn next_flush_deadline(&self) -> Option<Instant> {
        if !self.dirty || self.finalized {
            return None;
        }
        let earliest = match self.last_flush {
            Some(at) => at + self.config.debounce(),
            None => Instant::now(),
        };
        Some(match self.backoff_until {
            Some(until) if until > earliest => until,
            _ => earliest,
        })
    }

    /// Flush if the debounce interval (and any backoff) has elapsed
    ///
    /// Returns whether a flush was attempted.
    pub async fn flush_if_due(&mut self) -> bool {
        match self.next_flush_deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                self.flush_now().await;
                true
            }
            _ => false,
        }
    }

    /// Finish the output as completed
    pub async fn finalize(&mut self) {
        self.finalize_with(TerminalMark::Completed).await;
    }

    /// Drop the status line, append the terminal mark, and flush immediately
    ///
    /// Calling this more than once has no further effect.
    pub async fn finalize_with(&mut self, mark: TerminalMark) {
        if self.finalized {
            return;
        }

        // A gap that never filled: keep the content anyway, in order
        if !self.held.is_empty() {
            warn!(user_id = self.user_id, held = self.held.len(), "Finalizing with out-of-order updates");
            let held = std::mem::take(&mut self.held);
            for (_, item) in held {
                self.apply(item);
            }
        }

        self.status = None;
        match &mark {
            TerminalMark::Completed => {}
            TerminalMark::Failed(message) => {
                let line = format!("❌ **Failed:** {}", markup::escape_markdown(message));
                self.push_block(&line);
            }
            TerminalMark::Cancelled => self.push_block("⏹ _Cancelled_"),
        }
        self.finalized = true;
        self.dirty = true;

        self.flush_now().await;

        // Last flush got deferred by rate limiting: wait it out a bounded
        // number of times, unless the turn was cancelled
        let mut attempts = 0;
        while self.dirty && attempts < self.config.max_rate_limit_retries && !self.cancel.is_cancelled() {
            attempts += 1;
            if let Some(until) = self.backoff_until {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(until) => {}
                }
            }
            self.flush_now().await;
        }
        if self.dirty {
            error!(user_id = self.user_id, "Final output could not be delivered");
        }
        debug!(user_id = self.user_id, ?mark, parts = self.buffer.part_count(), "Render target finalized");
    }

    fn push_block(&mut self, block: &str) {
        if self.buffer.is_empty() {
            self.push_text(block);
        } else if self.buffer.ends_with_newline() {
            self.push_text(&format!("\n{}", block));
        } else {
            self.push_text(&format!("\n\n{}", block));
        }
    }

    /// Compose the full message text of part `idx`
    fn compose(&self, idx: usize, flavor: Flavor) -> String {
        let parts = self.buffer.parts();
        let Some(part) = parts.get(idx) else {
            return String::new();
        };
        let html = flavor == Flavor::Html;
        let mut out = String::new();

        if parts.len() > 1 {
            if html {
                out.push_str(&format!("<i>(part {})</i>\n", idx + 1));
            } else {
                out.push_str(&format!("(part {})\n", idx + 1));
            }
        }

        let body = part.render(flavor);
        out.push_str(body.trim_end_matches('\n'));

        if idx + 1 == parts.len()
            && let Some(status) = &self.status
        {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            if html {
                out.push_str(&format!("<i>⏳ {}</i>", markup::escape_html_truncated(status, STATUS_MAX_CHARS)));
            } else {
                out.push_str(&format!("⏳ {}", markup::truncate_chars(status, STATUS_MAX_CHARS)));
            }
        }

        if out.trim().is_empty() {
            out = if self.finalized { "✅ Done".to_string() } else { "…".to_string() };
        }
        out
    }

    /// Push every changed part to the transport, ignoring the debounce
    pub async fn flush_now(&mut self) {
        self.last_flush = Some(Instant::now());
        self.dirty = false;

        for idx in 0..self.buffer.part_count() {
            let text = self.compose(idx, Flavor::Html);
            if self.messages[idx].shown.as_deref() == Some(text.as_str()) {
                continue;
            }
            match self.deliver(idx, OutboundText::html(text.clone())).await {
                Delivery::Done | Delivery::Abandoned => self.messages[idx].shown = Some(text),
                Delivery::Deferred => {
                    self.dirty = true;
                    break;
                }
            }
        }
    }

    async fn deliver(&mut self, idx: usize, text: OutboundText) -> Delivery {
        let mut text = text;
        let mut rate_limited = 0;
        let mut plain_tried = false;

        loop {
            let result = match &self.messages[idx].handle {
                Some(handle) => self.transport.edit(handle, &text).await.map(|_| None),
                None => self.transport.send(self.user_id, &text).await.map(Some),
            };

            match result {
                Ok(handle) => {
                    if let Some(handle) = handle {
                        self.messages[idx].handle = Some(handle);
                    }
                    self.backoff_until = None;
                    return Delivery::Done;
                }
                Err(TransportError::RateLimited { retry_after }) => {
                    let wait = self.config.backoff_for(retry_after);
                    if rate_limited >= self.config.max_rate_limit_retries || self.cancel.is_cancelled() {
                        warn!(
                            user_id = self.user_id,
                            part = idx,
                            wait_ms = wait.as_millis() as u64,
                            "Still rate limited, keeping output pending"
                        );
                        self.backoff_until = Some(Instant::now() + wait);
                        return Delivery::Deferred;
                    }
                    rate_limited += 1;
                    debug!(user_id = self.user_id, part = idx, attempt = rate_limited, wait_ms = wait.as_millis() as u64, "Rate limited, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.backoff_until = Some(Instant::now() + wait);
                            return Delivery::Deferred;
                        }
                        _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
                    }
                }
                Err(TransportError::BadContent(reason)) if !plain_tried => {
                    warn!(user_id = self.user_id, part = idx, %reason, "Markup rejected, retrying as plain text");
                    plain_tried = true;
                    text = OutboundText::plain(self.compose(idx, Flavor::Plain));
                }
                Err(TransportError::BadContent(reason)) => {
                    error!(user_id = self.user_id, part = idx, %reason, "Plain text rejected too, dropping this update");
                    return Delivery::Abandoned;
                }
                Err(TransportError::NotFound) if self.messages[idx].handle.is_some() => {
                    warn!(user_id = self.user_id, part = idx, "Message vanished, sending a new one");
                    self.messages[idx].handle = None;
                }
                Err(TransportError::NotFound) => {
                    error!(user_id = self.user_id, part = idx, "Chat not found, dropping this update");
                    return Delivery::Abandoned;
                }
                Err(TransportError::Other(reason)) => {
                    warn!(user_id = self.user_id, part = idx, %reason, "Transport failure, will retry on next flush");
                    return Delivery::Deferred;
                }
            }
        }
    }
}

/// Short description of a tool's input: its first string argument
fn tool_summary(input: &serde_json::Value) -> Option<String> {
    let object = input.as_object()?;
    object
        .values()
        .find_map(|v| v.as_str())
        .map(|s| markup::truncate_chars(s.lines().next().unwrap_or(""), 80))
        .filter(|s| !s.is_empty())
}
