//! Integration tests for the transactional outbox
//!
//! These tests verify:
//! - Published messages are captured, then forwarded by the sending loop
//! - Two instances sharing one store deliver every message exactly once
//! - Messages of uncaptured types bypass the outbox

mod common;

use bus_runtime::outbox::DefaultInstanceIdProvider;
use bus_runtime::{
    CancellationToken, InMemoryOutboxRepository, InMemoryTransport, MessageBus, MessageType,
    OutboxForwardingPublishInterceptor, OutboxSendingTask, OutboxSettings, ProducerSettings,
    SystemTimeProvider, TimeProvider,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InvoiceIssued {
    invoice: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRecorded {
    entry: String,
}

/// One process instance: a named bus capturing into the shared outbox and its sending loop
struct Instance {
    bus: Arc<MessageBus>,
    transport: Arc<InMemoryTransport>,
}

fn instance(
    instance_id: &str,
    repository: &Arc<InMemoryOutboxRepository>,
    time_provider: &Arc<dyn TimeProvider>,
) -> Instance {
    let settings = OutboxSettings {
        poll_batch_size: 4,
        poll_idle_sleep: Duration::from_millis(20),
        ..OutboxSettings::default()
    };
    let task = Arc::new(
        OutboxSendingTask::new(
            settings,
            repository.clone(),
            Arc::new(DefaultInstanceIdProvider::with_id(instance_id)),
            time_provider.clone(),
        )
        .unwrap(),
    );
    let transport = Arc::new(InMemoryTransport::new());
    let bus = MessageBus::builder()
        .name("billing")
        .transport(transport.clone())
        .produce(ProducerSettings::of::<InvoiceIssued>().default_path("invoices"))
        .produce(ProducerSettings::of::<AuditRecorded>().default_path("audit"))
        .publish_interceptor(Arc::new(OutboxForwardingPublishInterceptor::for_message_types(
            repository.clone(),
            time_provider.clone(),
            [MessageType::of::<InvoiceIssued>()],
        )))
        .lifecycle_interceptor(task)
        .build()
        .unwrap();

    Instance { bus, transport }
}

fn invoice_numbers(instance: &Instance) -> Vec<u32> {
    instance
        .transport
        .produced_to("invoices")
        .iter()
        .map(|message| {
            serde_json::from_slice::<InvoiceIssued>(&message.payload)
                .unwrap()
                .invoice
        })
        .collect()
}

#[tokio::test]
async fn test_two_instances_deliver_each_message_once() {
    common::init_tracing();

    // Arrange
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let repository = Arc::new(InMemoryOutboxRepository::new(4, time_provider.clone()));
    let first = instance("instance-1", &repository, &time_provider);
    let second = instance("instance-2", &repository, &time_provider);

    // Captured before either loop runs
    for invoice in 0..10 {
        first
            .bus
            .publish(&InvoiceIssued { invoice }, None, &CancellationToken::new())
            .await
            .unwrap();
        second
            .bus
            .publish(
                &InvoiceIssued {
                    invoice: invoice + 100,
                },
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }
    assert_eq!(repository.unsent_count(), 20);
    assert_eq!(first.transport.produced_count(), 0);

    // Act
    first.bus.start().await.unwrap();
    second.bus.start().await.unwrap();
    assert!(common::wait_until(|| repository.unsent_count() == 0).await);

    // Assert
    let mut delivered = invoice_numbers(&first);
    delivered.extend(invoice_numbers(&second));
    assert_eq!(delivered.len(), 20);
    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(unique.len(), 20);

    first.bus.dispose().await;
    second.bus.dispose().await;
}

#[tokio::test]
async fn test_uncaptured_type_is_produced_immediately() {
    common::init_tracing();

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let repository = Arc::new(InMemoryOutboxRepository::new(4, time_provider.clone()));
    let node = instance("instance-1", &repository, &time_provider);

    node.bus
        .publish(
            &AuditRecorded {
                entry: "login".to_string(),
            },
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(node.transport.produced_to("audit").len(), 1);
    assert!(repository.messages().is_empty());
}

#[tokio::test]
async fn test_publish_while_running_is_forwarded_with_headers_intact() {
    common::init_tracing();

    // Arrange
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let repository = Arc::new(InMemoryOutboxRepository::new(4, time_provider.clone()));
    let node = instance("instance-1", &repository, &time_provider);
    node.bus.start().await.unwrap();

    // Act
    node.bus
        .publish(&InvoiceIssued { invoice: 7 }, Some("invoices-eu"), &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert!(common::wait_until(|| node.transport.produced_count() == 1).await);
    let produced = node.transport.produced_to("invoices-eu");
    assert_eq!(produced.len(), 1);
    assert!(produced[0].headers.is_empty());
    assert!(common::wait_until(|| repository.unsent_count() == 0).await);

    node.bus.stop().await.unwrap();
}
