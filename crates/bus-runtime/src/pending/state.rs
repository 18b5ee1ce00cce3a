//! State tracked for a request awaiting its correlated response.

use crate::cancellation::CancellationToken;
use crate::error::BusError;
use crate::message::{MessageType, MessageValue, RequestId, Timestamp};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

/// Why a pending request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The request expired before a response arrived
    TimedOut,
    /// The caller's cancellation token was triggered
    Cancelled,
}

/// Terminal outcome of a pending request
#[derive(Debug)]
pub enum RequestOutcome {
    /// Response payload, already deserialized as the expected response type
    Response(MessageValue),
    /// Error reported by the remote request handler
    Fault(String),
    /// Request cancelled locally or by the sweeper
    Cancelled(CancelReason),
    /// Local failure while handling the response
    Failed(BusError),
}

/// Single-assignment completion slot.
///
/// Only the first call to [`CompletionSlot::try_resolve`] delivers its outcome;
/// later calls are no-ops returning `false`.
#[derive(Debug)]
pub struct CompletionSlot {
    sender: Mutex<Option<oneshot::Sender<RequestOutcome>>>,
}

impl CompletionSlot {
    /// Create an unresolved slot and the receiver observing it
    pub fn new() -> (Self, oneshot::Receiver<RequestOutcome>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }

    /// Resolve the slot. Returns `true` if this call won the resolution.
    pub fn try_resolve(&self, outcome: RequestOutcome) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(sender) => {
                // A dropped receiver means the caller stopped waiting; the slot
                // is resolved either way.
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Check whether the slot has been resolved
    pub fn is_resolved(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// A request registered in the pending store until its terminal resolution
#[derive(Debug)]
pub struct PendingRequestState {
    pub id: RequestId,
    pub request: MessageValue,
    pub request_type: MessageType,
    pub response_type: MessageType,
    pub created: Timestamp,
    pub expires: Timestamp,
    pub cancellation: CancellationToken,
    slot: CompletionSlot,
}

impl PendingRequestState {
    /// Create state and the receiver the caller awaits
    pub fn new(
        id: RequestId,
        request: MessageValue,
        request_type: MessageType,
        response_type: MessageType,
        created: Timestamp,
        expires: Timestamp,
        cancellation: CancellationToken,
    ) -> (Self, oneshot::Receiver<RequestOutcome>) {
        let (slot, receiver) = CompletionSlot::new();
        (
            Self {
                id,
                request,
                request_type,
                response_type,
                created,
                expires,
                cancellation,
                slot,
            },
            receiver,
        )
    }

    /// Resolve the completion slot; first resolution wins
    pub fn try_resolve(&self, outcome: RequestOutcome) -> bool {
        self.slot.try_resolve(outcome)
    }

    /// Check whether a terminal outcome has been delivered
    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Check whether the request is due for cancellation at `now`
    pub fn is_due_for_cancellation(&self, now: Timestamp) -> bool {
        self.expires <= now || self.cancellation.is_cancelled()
    }
}
