//! Tests for the in-memory outbox repository.

use super::*;
use crate::message::{Headers, MessageType};
use crate::time::ManualTimeProvider;
use bytes::Bytes;
use std::time::Duration;

struct Fixture {
    clock: Arc<ManualTimeProvider>,
    repository: InMemoryOutboxRepository,
    cancel: CancellationToken,
}

impl Fixture {
    fn new(batch_size: usize) -> Self {
        let clock = Arc::new(ManualTimeProvider::new(Timestamp::now()));
        Self {
            repository: InMemoryOutboxRepository::new(batch_size, clock.clone()),
            clock,
            cancel: CancellationToken::new(),
        }
    }

    async fn save(&self, path: &str) -> OutboxMessageId {
        let message = OutboxMessage::new(
            None,
            path,
            MessageType::new("OrderPlaced"),
            Bytes::from_static(b"{}"),
            Headers::new(),
            self.clock.now(),
        );
        let id = message.id;
        self.repository.save(message, &self.cancel).await.unwrap();
        id
    }

    fn lease_until(&self, duration: Duration) -> Timestamp {
        self.clock.now().add(duration)
    }
}

#[tokio::test]
async fn test_lock_respects_batch_size() {
    // Arrange
    let fixture = Fixture::new(2);
    for i in 0..3 {
        fixture.save(&format!("p{}", i)).await;
    }
    let expires = fixture.lease_until(Duration::from_secs(10));

    // Act
    let locked = fixture
        .repository
        .try_to_lock("a", expires, &fixture.cancel)
        .await
        .unwrap();
    let batch = fixture
        .repository
        .find_next_to_send("a", &fixture.cancel)
        .await
        .unwrap();

    // Assert
    assert_eq!(locked, 2);
    let paths: Vec<_> = batch.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["p0", "p1"]);
}

#[tokio::test]
async fn test_unexpired_lease_is_exclusive() {
    // Arrange
    let fixture = Fixture::new(10);
    fixture.save("orders").await;
    let expires = fixture.lease_until(Duration::from_secs(10));
    assert_eq!(
        fixture
            .repository
            .try_to_lock("a", expires, &fixture.cancel)
            .await
            .unwrap(),
        1
    );

    // Act
    fixture.clock.advance(Duration::from_secs(9));
    let second = fixture
        .repository
        .try_to_lock("b", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    // Assert
    assert_eq!(second, 0);
    assert!(fixture
        .repository
        .find_next_to_send("b", &fixture.cancel)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_expired_lease_can_be_claimed_by_another_instance() {
    let fixture = Fixture::new(10);
    fixture.save("orders").await;
    fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    fixture.clock.advance(Duration::from_secs(11));
    let claimed = fixture
        .repository
        .try_to_lock("b", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    assert_eq!(claimed, 1);
    assert!(fixture
        .repository
        .find_next_to_send("a", &fixture.cancel)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        fixture
            .repository
            .find_next_to_send("b", &fixture.cancel)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_owner_renews_its_own_lease() {
    let fixture = Fixture::new(10);
    fixture.save("orders").await;
    fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    let renewed_until = fixture.lease_until(Duration::from_secs(30));
    let renewed = fixture
        .repository
        .try_to_lock("a", renewed_until, &fixture.cancel)
        .await
        .unwrap();

    assert_eq!(renewed, 1);
    assert_eq!(
        fixture.repository.messages()[0].lock_expires_on,
        Some(renewed_until)
    );
}

#[tokio::test]
async fn test_update_to_sent_is_idempotent_and_stops_leasing() {
    // Arrange
    let fixture = Fixture::new(10);
    let id = fixture.save("orders").await;
    fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    // Act
    fixture
        .repository
        .update_to_sent(&[id], &fixture.cancel)
        .await
        .unwrap();
    let first_delivery = fixture.repository.messages()[0].delivered_on;
    fixture.clock.advance(Duration::from_secs(1));
    fixture
        .repository
        .update_to_sent(&[id], &fixture.cancel)
        .await
        .unwrap();

    // Assert
    assert!(first_delivery.is_some());
    assert_eq!(fixture.repository.messages()[0].delivered_on, first_delivery);
    assert_eq!(fixture.repository.unsent_count(), 0);
    assert_eq!(
        fixture
            .repository
            .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_released_row_is_claimable_by_others_but_not_its_releaser() {
    // Arrange
    let fixture = Fixture::new(1);
    let unroutable = fixture.save("billing").await;
    let routable = fixture.save("orders").await;
    fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    // Act
    fixture
        .repository
        .release(
            "a",
            &[unroutable],
            fixture.lease_until(Duration::from_secs(10)),
            &fixture.cancel,
        )
        .await
        .unwrap();

    // Assert
    let released = &fixture.repository.messages()[0];
    assert_eq!(released.lock_instance_id, None);
    assert_eq!(released.released_by.as_deref(), Some("a"));
    assert!(fixture
        .repository
        .find_next_to_send("a", &fixture.cancel)
        .await
        .unwrap()
        .is_empty());

    // The releaser moves on to the next row
    fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();
    let batch = fixture
        .repository
        .find_next_to_send("a", &fixture.cancel)
        .await
        .unwrap();
    assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![routable]);

    // Another instance claims the released row at once
    fixture
        .repository
        .try_to_lock("b", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();
    let batch = fixture
        .repository
        .find_next_to_send("b", &fixture.cancel)
        .await
        .unwrap();
    assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![unroutable]);
    assert_eq!(batch[0].released_by, None);
}

#[tokio::test]
async fn test_releaser_retries_after_the_release_expires() {
    let fixture = Fixture::new(10);
    let id = fixture.save("billing").await;
    fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();
    fixture
        .repository
        .release("a", &[id], fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    let before = fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();
    fixture.clock.advance(Duration::from_secs(11));
    let after = fixture
        .repository
        .try_to_lock("a", fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    assert_eq!(before, 0);
    assert_eq!(after, 1);
}

#[tokio::test]
async fn test_release_ignores_rows_leased_to_another_instance() {
    let fixture = Fixture::new(10);
    let id = fixture.save("orders").await;
    let expires = fixture.lease_until(Duration::from_secs(10));
    fixture
        .repository
        .try_to_lock("a", expires, &fixture.cancel)
        .await
        .unwrap();

    fixture
        .repository
        .release("b", &[id], fixture.lease_until(Duration::from_secs(10)), &fixture.cancel)
        .await
        .unwrap();

    let row = &fixture.repository.messages()[0];
    assert_eq!(row.lock_instance_id.as_deref(), Some("a"));
    assert_eq!(row.lock_expires_on, Some(expires));
    assert_eq!(row.released_by, None);
}

#[tokio::test]
async fn test_delete_sent_only_removes_old_sent_rows() {
    // Arrange
    let fixture = Fixture::new(10);
    let old_sent = fixture.save("old-sent").await;
    fixture.save("old-unsent").await;
    fixture.clock.advance(Duration::from_secs(7200));
    let new_sent = fixture.save("new-sent").await;
    fixture
        .repository
        .update_to_sent(&[old_sent, new_sent], &fixture.cancel)
        .await
        .unwrap();

    // Act
    let deleted = fixture
        .repository
        .delete_sent(fixture.clock.now().sub(Duration::from_secs(3600)), &fixture.cancel)
        .await
        .unwrap();

    // Assert
    assert_eq!(deleted, 1);
    let remaining: Vec<_> = fixture
        .repository
        .messages()
        .into_iter()
        .map(|m| m.path)
        .collect();
    assert_eq!(remaining, vec!["old-unsent", "new-sent"]);
}

#[tokio::test]
async fn test_cancelled_calls_are_rejected() {
    let fixture = Fixture::new(10);
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        fixture.repository.migrate(&cancel).await,
        Err(BusError::Cancelled)
    ));
    assert!(matches!(
        fixture
            .repository
            .try_to_lock("a", Timestamp::now(), &cancel)
            .await,
        Err(BusError::Cancelled)
    ));
}
