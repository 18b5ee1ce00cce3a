//! Tests for the composite bus.

use super::*;
use crate::settings::ProducerSettings;
use crate::transports::InMemoryTransport;
use serde::Deserialize;

#[derive(Debug, Serialize, Deserialize)]
struct InvoiceIssued {
    number: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShipmentDispatched {
    tracking: String,
}

fn child(name: &str, transport: &Arc<InMemoryTransport>, producer: ProducerSettings) -> Arc<MessageBus> {
    MessageBus::builder()
        .name(name)
        .transport(transport.clone())
        .produce(producer)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_publish_routes_to_declaring_child() {
    // Arrange
    let billing_transport = Arc::new(InMemoryTransport::new());
    let shipping_transport = Arc::new(InMemoryTransport::new());
    let composite = CompositeMessageBus::new()
        .with_child(child(
            "billing",
            &billing_transport,
            ProducerSettings::of::<InvoiceIssued>().default_path("invoices"),
        ))
        .unwrap()
        .with_child(child(
            "shipping",
            &shipping_transport,
            ProducerSettings::of::<ShipmentDispatched>().default_path("shipments"),
        ))
        .unwrap();

    // Act
    composite
        .publish(&InvoiceIssued { number: 7 }, None, &CancellationToken::new())
        .await
        .unwrap();

    // Assert
    assert_eq!(billing_transport.produced_to("invoices").len(), 1);
    assert_eq!(shipping_transport.produced_count(), 0);
    assert!(composite.get_child_bus("shipping").is_some());
    assert!(composite.get_child_bus("unknown").is_none());
}

#[tokio::test]
async fn test_publish_of_undeclared_type_fails() {
    let transport = Arc::new(InMemoryTransport::new());
    let composite = CompositeMessageBus::new()
        .with_child(child(
            "billing",
            &transport,
            ProducerSettings::of::<InvoiceIssued>().default_path("invoices"),
        ))
        .unwrap();

    let result = composite
        .publish(
            &ShipmentDispatched {
                tracking: "t-1".to_string(),
            },
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(
        result,
        Err(BusError::ConfigurationError(
            ConfigurationError::UnknownProducer { .. }
        ))
    ));
}

#[test]
fn test_children_require_unique_names() {
    let transport = Arc::new(InMemoryTransport::new());
    let mut composite = CompositeMessageBus::new();
    composite
        .add_child(child("billing", &transport, ProducerSettings::of::<InvoiceIssued>()))
        .unwrap();

    assert!(composite
        .add_child(child("billing", &transport, ProducerSettings::of::<InvoiceIssued>()))
        .is_err());

    let unnamed = MessageBus::builder()
        .transport(transport.clone())
        .build()
        .unwrap();
    assert!(matches!(
        composite.add_child(unnamed),
        Err(BusError::ConfigurationError(ConfigurationError::Missing { .. }))
    ));
}

#[tokio::test]
async fn test_start_and_stop_cover_all_children() {
    let transport = Arc::new(InMemoryTransport::new());
    let composite = CompositeMessageBus::new()
        .with_child(child("a", &transport, ProducerSettings::of::<InvoiceIssued>()))
        .unwrap()
        .with_child(child("b", &transport, ProducerSettings::of::<ShipmentDispatched>()))
        .unwrap();

    composite.start().await.unwrap();
    assert!(composite.children().all(|bus| bus.is_started()));

    composite.stop().await.unwrap();
    assert!(composite.children().all(|bus| !bus.is_started()));
}
