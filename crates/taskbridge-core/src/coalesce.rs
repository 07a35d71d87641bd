//! Input Coalescer - merges a user's rapid consecutive messages
//!
//! ```text
//!  submit("a") ──▶ open batch, arm countdown ─┐
//!  submit("b") ──▶ append                     │ window
//!                                             ▼
//!                          countdown fires: take batch ──▶ BatchSink::deliver(["a","b"])
//! ```
//!
//! Whoever removes the batch from the user's slot (the countdown or an
//! explicit cancel) owns it, so a batch is delivered at most once. Cancelling
//! signals the countdown through its token and then waits for it to settle,
//! bounded by `settle_timeout`. A slot with no batch and no countdown left
//! is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CoalesceConfig;
use crate::partition::UserPartition;
use crate::session::UserId;

/// Inputs from one user, merged across one window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedBatch {
    pub user_id: UserId,
    pub inputs: Vec<String>,
    pub opened_at: DateTime<Utc>,
}

impl CoalescedBatch {
    /// All inputs joined into one text
    pub fn combined_text(&self, separator: &str) -> String {
        self.inputs.join(separator)
    }
}

/// Receiver of closed batches
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, batch: CoalescedBatch);
}

/// How a cancelled countdown finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// No countdown was armed
    Idle,
    /// The countdown stopped (or finished firing) within the bound
    Settled,
    /// The countdown was still running when the bound elapsed
    TimedOut,
}

/// Result of cancelling a user's countdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    /// The batch, if the countdown had not already taken it
    pub batch: Option<CoalescedBatch>,
    pub settlement: Settlement,
}

struct OpenBatch {
    id: u64,
    inputs: Vec<String>,
    opened_at: DateTime<Utc>,
}

struct Countdown {
    batch_id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    batch: Option<OpenBatch>,
    /// Kept after the batch is taken, until the countdown finishes delivering
    countdown: Option<Countdown>,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.batch.is_none() && self.countdown.is_none()
    }
}

/// Per-user debounce of inbound messages
pub struct InputCoalescer {
    slots: Arc<UserPartition<Slot>>,
    sink: Arc<dyn BatchSink>,
    config: CoalesceConfig,
    /// Batch ids are unique across slots, so a late countdown never matches
    /// a batch opened in a recreated slot
    next_batch_id: AtomicU64,
}

impl InputCoalescer {
    pub fn new(sink: Arc<dyn BatchSink>, config: CoalesceConfig) -> Self {
        Self {
            slots: Arc::new(UserPartition::new()),
            sink,
            config,
            next_batch_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CoalesceConfig {
        &self.config
    }

    /// Add an input to the user's open batch, opening one if needed
    pub fn submit(&self, user_id: UserId, input: impl Into<String>) {
        let input = input.into();
        self.slots.with(user_id, |slot| {
            if let Some(batch) = &mut slot.batch {
                batch.inputs.push(input);
                debug!(user_id, batch_id = batch.id, inputs = batch.inputs.len(), "Appended to open batch");
                return;
            }

            let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
            slot.batch = Some(OpenBatch {
                id,
                inputs: vec![input],
                opened_at: Utc::now(),
            });

            let token = CancellationToken::new();
            let handle = tokio::spawn(run_countdown(
                self.slots.clone(),
                self.sink.clone(),
                user_id,
                id,
                self.config.window(),
                token.clone(),
            ));
            slot.countdown = Some(Countdown {
                batch_id: id,
                token,
                handle,
            });
            debug!(user_id, batch_id = id, "Opened batch");
        });
    }

    /// Inputs waiting in the user's open batch
    pub fn pending(&self, user_id: UserId) -> Option<Vec<String>> {
        let slot = self.slots.existing(user_id)?;
        let slot = slot.lock();
        slot.batch.as_ref().map(|b| b.inputs.clone())
    }

    /// Users with an open batch
    pub fn queued_users(&self) -> Vec<UserId> {
        self.slots
            .users()
            .into_iter()
            .filter(|&user_id| self.slots.existing(user_id).is_some_and(|slot| slot.lock().batch.is_some()))
            .collect()
    }

    /// Stop the user's countdown and take the open batch without delivering it
    pub async fn cancel(&self, user_id: UserId) -> CancelOutcome {
        let (batch, countdown) = self.slots.with(user_id, |slot| (slot.batch.take(), slot.countdown.take()));
        self.slots.remove_if(user_id, Slot::is_idle);
        let batch = batch.map(|open| open.into_batch(user_id));

        let Some(countdown) = countdown else {
            return CancelOutcome {
                batch,
                settlement: Settlement::Idle,
            };
        };

        countdown.token.cancel();
        let settlement = match tokio::time::timeout(self.config.settle_timeout(), countdown.handle).await {
            Ok(_) => Settlement::Settled,
            Err(_) => {
                warn!(
                    user_id,
                    batch_id = countdown.batch_id,
                    timeout_ms = self.config.settle_timeout_ms,
                    "Countdown did not settle after cancel"
                );
                Settlement::TimedOut
            }
        };
        debug!(user_id, ?settlement, had_batch = batch.is_some(), "Countdown cancelled");

        CancelOutcome { batch, settlement }
    }

    /// Deliver the open batch now instead of waiting for the window
    ///
    /// Returns whether a batch was delivered by this call.
    pub async fn cancel_and_flush(&self, user_id: UserId) -> bool {
        let outcome = self.cancel(user_id).await;
        match outcome.batch {
            Some(batch) => {
                self.sink.deliver(batch).await;
                true
            }
            None => false,
        }
    }

    /// Discard the open batch, if any
    pub async fn discard(&self, user_id: UserId) -> Option<CoalescedBatch> {
        self.cancel(user_id).await.batch
    }
}

impl OpenBatch {
    fn into_batch(self, user_id: UserId) -> CoalescedBatch {
        CoalescedBatch {
            user_id,
            inputs: self.inputs,
            opened_at: self.opened_at,
        }
    }
}

async fn run_countdown(
    slots: Arc<UserPartition<Slot>>,
    sink: Arc<dyn BatchSink>,
    user_id: UserId,
    batch_id: u64,
    window: Duration,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(window) => {}
    }

    let batch = slots.existing(user_id).and_then(|slot| {
        let mut slot = slot.lock();
        if slot.batch.as_ref().is_some_and(|open| open.id == batch_id) {
            slot.batch.take()
        } else {
            None
        }
    });

    if let Some(open) = batch {
        debug!(user_id, batch_id, inputs = open.inputs.len(), "Window elapsed, flushing batch");
        sink.deliver(open.into_batch(user_id)).await;
    }

    if let Some(slot) = slots.existing(user_id) {
        let mut slot = slot.lock();
        if slot.countdown.as_ref().is_some_and(|c| c.batch_id == batch_id) {
            slot.countdown = None;
        }
    }
    slots.remove_if(user_id, Slot::is_idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<CoalescedBatch>);

    #[async_trait]
    impl BatchSink for ChannelSink {
        async fn deliver(&self, batch: CoalescedBatch) {
            let _ = self.0.send(batch);
        }
    }

    /// Never returns from `deliver`
    struct StuckSink;

    #[async_trait]
    impl BatchSink for StuckSink {
        async fn deliver(&self, _batch: CoalescedBatch) {
            std::future::pending::<()>().await;
        }
    }

    fn coalescer() -> (InputCoalescer, mpsc::UnboundedReceiver<CoalescedBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            InputCoalescer::new(Arc::new(ChannelSink(tx)), CoalesceConfig::default()),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_inputs_within_window_form_one_batch() {
        let (coalescer, mut rx) = coalescer();
        coalescer.submit(1, "a");
        coalescer.submit(1, "b");
        assert_eq!(coalescer.pending(1), Some(vec!["a".to_string(), "b".to_string()]));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.inputs, vec!["a", "b"]);
        assert_eq!(batch.combined_text("\n\n"), "a\n\nb");

        // Exactly once
        assert!(tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.is_err());
        assert_eq!(coalescer.pending(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inputs_across_windows_form_two_batches() {
        let (coalescer, mut rx) = coalescer();
        coalescer.submit(1, "a");
        tokio::time::sleep(Duration::from_millis(2000)).await;
        coalescer.submit(1, "b");

        assert_eq!(rx.recv().await.unwrap().inputs, vec!["a"]);
        assert_eq!(rx.recv().await.unwrap().inputs, vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_are_independent() {
        let (coalescer, mut rx) = coalescer();
        coalescer.submit(1, "one");
        coalescer.submit(2, "two");

        let mut users = vec![rx.recv().await.unwrap().user_id, rx.recv().await.unwrap().user_id];
        users.sort();
        assert_eq!(users, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_flush_delivers_once() {
        let (coalescer, mut rx) = coalescer();
        coalescer.submit(1, "a");

        assert!(coalescer.cancel_and_flush(1).await);
        assert_eq!(rx.recv().await.unwrap().inputs, vec!["a"]);

        // The countdown was stopped and has nothing left to deliver
        assert!(tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.is_err());
        assert!(!coalescer.cancel_and_flush(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_settles_idle_countdown() {
        let (coalescer, _rx) = coalescer();
        coalescer.submit(1, "a");

        let outcome = coalescer.cancel(1).await;
        assert_eq!(outcome.settlement, Settlement::Settled);
        assert_eq!(outcome.batch.unwrap().inputs, vec!["a"]);

        assert_eq!(coalescer.cancel(1).await.settlement, Settlement::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_released_when_idle() {
        let (coalescer, mut rx) = coalescer();
        coalescer.submit(1, "a");
        coalescer.submit(2, "b");
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        // Let both countdowns finish their bookkeeping after delivering
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coalescer.slots.is_empty());

        coalescer.submit(3, "c");
        assert!(coalescer.discard(3).await.is_some());
        assert_eq!(coalescer.cancel(9).await.settlement, Settlement::Idle);
        assert!(coalescer.slots.is_empty());
        assert!(coalescer.queued_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_bounded_when_delivery_hangs() {
        let coalescer = InputCoalescer::new(Arc::new(StuckSink), CoalesceConfig::default());
        coalescer.submit(1, "a");

        // Let the countdown fire and get stuck inside the sink
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(coalescer.pending(1), None);

        let started = tokio::time::Instant::now();
        let outcome = coalescer.cancel(1).await;
        assert_eq!(outcome.settlement, Settlement::TimedOut);
        assert_eq!(outcome.batch, None);
        assert!(started.elapsed() <= Duration::from_millis(1000) + Duration::from_millis(10));
    }
}
