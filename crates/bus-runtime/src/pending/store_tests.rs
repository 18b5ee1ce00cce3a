//! Tests for the pending request store and completion slot.

use super::*;
use crate::cancellation::CancellationToken;
use crate::message::MessageType;
use crate::pending::state::{CancelReason, RequestOutcome};
use serde_json::json;
use std::time::Duration;

fn pending(
    created: Timestamp,
    timeout: Duration,
) -> (
    Arc<PendingRequestState>,
    tokio::sync::oneshot::Receiver<RequestOutcome>,
) {
    let (state, receiver) = PendingRequestState::new(
        RequestId::new(),
        json!({ "query": "ping" }),
        MessageType::new("PingRequest"),
        MessageType::new("PingResponse"),
        created,
        created.add(timeout),
        CancellationToken::new(),
    );
    (Arc::new(state), receiver)
}

// ============================================================================
// Store Tests
// ============================================================================

#[test]
fn test_add_rejects_duplicate_identifier() {
    // Arrange
    let store = InMemoryPendingRequestStore::new();
    let (state, _rx) = pending(Timestamp::now(), Duration::from_secs(10));

    // Act
    store.add(state.clone()).unwrap();
    let result = store.add(state.clone());

    // Assert
    match result {
        Err(BusError::DuplicateRequest { request_id }) => {
            assert_eq!(request_id, state.id.to_string())
        }
        other => panic!("Expected DuplicateRequest, got: {:?}", other),
    }
    assert_eq!(store.count(), 1);
}

#[test]
fn test_remove_is_idempotent() {
    let store = InMemoryPendingRequestStore::new();
    let (state, _rx) = pending(Timestamp::now(), Duration::from_secs(10));
    store.add(state.clone()).unwrap();

    assert!(store.remove(&state.id));
    assert!(!store.remove(&state.id));
    assert!(store.get_by_id(&state.id).is_none());
    assert_eq!(store.count(), 0);
}

#[test]
fn test_find_all_to_cancel_returns_expired_and_cancelled_entries() {
    // Arrange
    let store = InMemoryPendingRequestStore::new();
    let start = Timestamp::now();
    let (expired, _rx1) = pending(start, Duration::from_secs(1));
    let (live, _rx2) = pending(start, Duration::from_secs(60));
    let (cancelled, _rx3) = pending(start, Duration::from_secs(60));
    cancelled.cancellation.cancel();
    for state in [&expired, &live, &cancelled] {
        store.add(Arc::clone(state)).unwrap();
    }

    // Act
    let due = store.find_all_to_cancel(start.add(Duration::from_secs(1)));

    // Assert
    let mut due_ids: Vec<_> = due.iter().map(|s| s.id.to_string()).collect();
    due_ids.sort();
    let mut expected = vec![expired.id.to_string(), cancelled.id.to_string()];
    expected.sort();
    assert_eq!(due_ids, expected);
}

#[test]
fn test_remove_all_ignores_unknown_identifiers() {
    let store = InMemoryPendingRequestStore::new();
    let (a, _rx1) = pending(Timestamp::now(), Duration::from_secs(10));
    let (b, _rx2) = pending(Timestamp::now(), Duration::from_secs(10));
    store.add(a.clone()).unwrap();
    store.add(b.clone()).unwrap();

    store.remove_all(&[a.id.clone(), RequestId::new()]);

    assert!(store.get_by_id(&a.id).is_none());
    assert!(store.get_by_id(&b.id).is_some());
    assert_eq!(store.count(), 1);
}

// ============================================================================
// Completion Slot Tests
// ============================================================================

#[tokio::test]
async fn test_first_resolution_wins() {
    let (state, receiver) = pending(Timestamp::now(), Duration::from_secs(10));

    assert!(state.try_resolve(RequestOutcome::Response(json!({ "answer": 42 }))));
    assert!(!state.try_resolve(RequestOutcome::Cancelled(CancelReason::TimedOut)));
    assert!(state.is_resolved());

    match receiver.await.unwrap() {
        RequestOutcome::Response(value) => assert_eq!(value["answer"], 42),
        other => panic!("Expected response, got: {:?}", other),
    }
}

#[test]
fn test_resolution_succeeds_when_receiver_dropped() {
    let (state, receiver) = pending(Timestamp::now(), Duration::from_secs(10));
    drop(receiver);

    assert!(state.try_resolve(RequestOutcome::Fault("boom".to_string())));
    assert!(!state.try_resolve(RequestOutcome::Fault("again".to_string())));
}
