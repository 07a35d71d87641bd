//! Interaction Broker - single-slot request/response correlation per user
//!
//! ## Design
//!
//! - Each user has one slot holding at most one pending request and the
//!   sending half of a oneshot channel
//! - `respond` and `cancel` take the sender out of the slot and signal it
//!   under the slot lock, so a response is delivered whole or not at all
//! - `await_response` removes its own request on timeout; a response that
//!   raced the timeout is still picked up from the channel
//! - Slots are per user, different users never contend, and an emptied
//!   slot is dropped once its waiter is done with it

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::types::{
    InteractionKind, InteractionPrompt, InteractionRequest, InteractionResponse, WaitOutcome,
};
use crate::error::{Error, Result};
use crate::partition::UserPartition;
use crate::session::UserId;

/// Value delivered into a waiting turn
#[derive(Debug)]
enum Resolution {
    Response(InteractionResponse),
    Cancelled,
}

struct Pending {
    request: InteractionRequest,
    tx: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}

/// Receiving side of one outstanding request
#[derive(Debug)]
pub struct RequestHandle {
    request: InteractionRequest,
    rx: oneshot::Receiver<Resolution>,
}

impl RequestHandle {
    pub fn request(&self) -> &InteractionRequest {
        &self.request
    }

    pub fn user_id(&self) -> UserId {
        self.request.user_id
    }

    pub fn kind(&self) -> InteractionKind {
        self.request.kind()
    }
}

/// Correlates each user's outstanding interactive request with its response
#[derive(Default)]
pub struct InteractionBroker {
    slots: UserPartition<Slot>,
}

impl InteractionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request for a user
    ///
    /// Fails with `AlreadyPending` while another request is outstanding. A
    /// slot whose waiter has gone away is reclaimed instead.
    pub fn open(&self, user_id: UserId, prompt: InteractionPrompt) -> Result<RequestHandle> {
        let request = InteractionRequest::new(user_id, prompt);
        let (tx, rx) = oneshot::channel();

        self.slots.with(user_id, |slot| {
            if let Some(existing) = &slot.pending {
                if !existing.tx.is_closed() {
                    error!(
                        user_id,
                        pending = %existing.request.kind(),
                        requested = %request.kind(),
                        "Interaction already pending"
                    );
                    return Err(Error::AlreadyPending {
                        user_id,
                        kind: existing.request.kind(),
                    });
                }
                warn!(user_id, request_id = %existing.request.id, "Reclaiming abandoned interaction slot");
            }
            debug!(user_id, request_id = %request.id, kind = %request.kind(), "Opened interaction");
            slot.pending = Some(Pending {
                request: request.clone(),
                tx,
            });
            Ok(RequestHandle { request, rx })
        })
    }

    /// Wait for the response to an opened request
    ///
    /// Returns `TimedOut` when nothing arrived within `timeout`; the request
    /// is removed first, so a late `respond` gets `NoPendingRequest` instead
    /// of writing into a stale slot.
    pub async fn await_response(&self, handle: RequestHandle, timeout: Duration) -> WaitOutcome {
        let user_id = handle.user_id();
        let outcome = self.wait(handle, timeout).await;
        self.slots.remove_if(user_id, Slot::is_empty);
        outcome
    }

    async fn wait(&self, handle: RequestHandle, timeout: Duration) -> WaitOutcome {
        let RequestHandle { request, mut rx } = handle;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => return resolution.into(),
            // Sender dropped without a value: the slot was reclaimed or the broker dropped
            Ok(Err(_)) => return WaitOutcome::Cancelled,
            Err(_) => {}
        }

        self.slots.with(request.user_id, |slot| {
            if slot
                .pending
                .as_ref()
                .is_some_and(|p| p.request.id == request.id)
            {
                slot.pending = None;
            }
        });

        // A response recorded between the timer firing and the removal above wins
        match rx.try_recv() {
            Ok(resolution) => resolution.into(),
            Err(_) => {
                warn!(user_id = request.user_id, request_id = %request.id, kind = %request.kind(), "Interaction timed out");
                WaitOutcome::TimedOut
            }
        }
    }

    /// Record a response and wake the waiting turn
    pub fn respond(&self, user_id: UserId, response: InteractionResponse) -> Result<()> {
        let Some(slot) = self.slots.existing(user_id) else {
            return Err(Error::NoPendingRequest { user_id });
        };
        let mut slot = slot.lock();
        let Some(pending) = slot.pending.take() else {
            return Err(Error::NoPendingRequest { user_id });
        };

        let expected = pending.request.kind();
        if expected != response.kind() {
            let got = response.kind();
            slot.pending = Some(pending);
            return Err(Error::ResponseMismatch {
                user_id,
                expected,
                got,
            });
        }

        debug!(user_id, request_id = %pending.request.id, kind = %expected, "Delivering interaction response");
        pending
            .tx
            .send(Resolution::Response(response))
            .map_err(|_| Error::NoPendingRequest { user_id })
    }

    /// Remove any outstanding request and release its waiter with `Cancelled`
    ///
    /// Returns whether a request was pending.
    pub fn cancel(&self, user_id: UserId) -> bool {
        let Some(slot) = self.slots.existing(user_id) else {
            return false;
        };
        let cancelled = match slot.lock().pending.take() {
            Some(pending) => {
                debug!(user_id, request_id = %pending.request.id, "Cancelling interaction");
                let _ = pending.tx.send(Resolution::Cancelled);
                true
            }
            None => false,
        };
        drop(slot);
        self.slots.remove_if(user_id, Slot::is_empty);
        cancelled
    }

    /// The user's outstanding request, if any
    pub fn pending(&self, user_id: UserId) -> Option<InteractionRequest> {
        let slot = self.slots.existing(user_id)?;
        let slot = slot.lock();
        slot.pending.as_ref().map(|p| p.request.clone())
    }
}

impl From<Resolution> for WaitOutcome {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Response(response) => WaitOutcome::Responded(response),
            Resolution::Cancelled => WaitOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn permission_prompt() -> InteractionPrompt {
        InteractionPrompt::Permission {
            tool_name: "Write".to_string(),
            arguments: serde_json::json!({"file_path": "/tmp/out.txt"}),
        }
    }

    fn question_prompt() -> InteractionPrompt {
        InteractionPrompt::Question {
            question: "Which branch?".to_string(),
            options: vec![],
        }
    }

    #[tokio::test]
    async fn test_open_twice_is_already_pending() {
        let broker = InteractionBroker::new();
        let _handle = broker.open(1, permission_prompt()).unwrap();

        let second = broker.open(1, question_prompt());
        assert!(matches!(
            second,
            Err(Error::AlreadyPending {
                user_id: 1,
                kind: InteractionKind::Permission
            })
        ));

        // Other users are unaffected
        assert!(broker.open(2, question_prompt()).is_ok());
    }

    #[tokio::test]
    async fn test_respond_without_request() {
        let broker = InteractionBroker::new();
        let result = broker.respond(1, InteractionResponse::Question { answer: "x".into() });
        assert!(matches!(result, Err(Error::NoPendingRequest { user_id: 1 })));
    }

    #[tokio::test]
    async fn test_respond_wakes_waiter() {
        let broker = Arc::new(InteractionBroker::new());
        let handle = broker.open(1, permission_prompt()).unwrap();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_response(handle, Duration::from_secs(5)).await })
        };

        broker
            .respond(
                1,
                InteractionResponse::Permission {
                    approved: false,
                    clarification: Some("use a different path".to_string()),
                },
            )
            .unwrap();

        let outcome = waiter.await.unwrap();
        assert_eq!(
            outcome,
            WaitOutcome::Responded(InteractionResponse::Permission {
                approved: false,
                clarification: Some("use a different path".to_string()),
            })
        );
        assert!(broker.pending(1).is_none());
    }

    #[tokio::test]
    async fn test_mismatched_response_keeps_request() {
        let broker = InteractionBroker::new();
        let _handle = broker.open(1, permission_prompt()).unwrap();

        let result = broker.respond(1, InteractionResponse::Question { answer: "yes".into() });
        assert!(matches!(
            result,
            Err(Error::ResponseMismatch {
                expected: InteractionKind::Permission,
                got: InteractionKind::Question,
                ..
            })
        ));
        assert!(broker.pending(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_request() {
        let broker = InteractionBroker::new();
        let handle = broker.open(1, question_prompt()).unwrap();

        let outcome = broker.await_response(handle, Duration::from_secs(30)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(broker.pending(1).is_none());

        // A late answer has nowhere to go
        let late = broker.respond(1, InteractionResponse::Question { answer: "late".into() });
        assert!(matches!(late, Err(Error::NoPendingRequest { .. })));

        // And the slot is free again
        assert!(broker.open(1, question_prompt()).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let broker = Arc::new(InteractionBroker::new());
        let handle = broker.open(1, question_prompt()).unwrap();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_response(handle, Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;

        assert!(broker.cancel(1));
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Cancelled);
        assert!(!broker.cancel(1));
    }

    #[tokio::test]
    async fn test_abandoned_slot_is_reclaimed() {
        let broker = InteractionBroker::new();
        let handle = broker.open(1, question_prompt()).unwrap();
        drop(handle);

        assert!(broker.open(1, permission_prompt()).is_ok());
        assert_eq!(broker.pending(1).unwrap().kind(), InteractionKind::Permission);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_interactions_release_slots() {
        let broker = InteractionBroker::new();

        let handle = broker.open(1, question_prompt()).unwrap();
        broker
            .respond(1, InteractionResponse::Question { answer: "main".into() })
            .unwrap();
        let outcome = broker.await_response(handle, Duration::from_secs(5)).await;
        assert!(matches!(outcome, WaitOutcome::Responded(_)));

        let handle = broker.open(2, question_prompt()).unwrap();
        assert_eq!(broker.await_response(handle, Duration::from_secs(5)).await, WaitOutcome::TimedOut);

        let _handle = broker.open(3, question_prompt()).unwrap();
        assert!(broker.cancel(3));

        // Stray answers do not leave slots behind either
        assert!(broker.respond(4, InteractionResponse::Question { answer: "?".into() }).is_err());
        assert!(broker.slots.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_respond_racing_cancel_is_all_or_nothing() {
        for _ in 0..50 {
            let broker = Arc::new(InteractionBroker::new());
            let handle = broker.open(1, permission_prompt()).unwrap();
            let response = InteractionResponse::Permission {
                approved: false,
                clarification: Some("use a different path".into()),
            };

            let responder = {
                let broker = broker.clone();
                let response = response.clone();
                tokio::spawn(async move { broker.respond(1, response) })
            };
            let canceller = {
                let broker = broker.clone();
                tokio::spawn(async move { broker.cancel(1) })
            };

            let outcome = broker.await_response(handle, Duration::from_secs(5)).await;
            let responded = responder.await.unwrap().is_ok();
            let cancelled = canceller.await.unwrap();

            // Exactly one side took the request
            assert!(responded != cancelled);
            match outcome {
                WaitOutcome::Responded(got) => {
                    assert!(responded);
                    assert_eq!(got, response);
                }
                WaitOutcome::Cancelled => assert!(cancelled),
                WaitOutcome::TimedOut => panic!("Neither respond nor cancel reached the waiter"),
            }
            assert!(broker.pending(1).is_none());
        }
    }
}
