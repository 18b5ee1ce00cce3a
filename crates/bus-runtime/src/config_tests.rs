//! Tests for layered runtime configuration.

use super::*;
use crate::bus::MessageBus;
use crate::transports::InMemoryTransport;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_empty_document_yields_defaults() {
    let config = RuntimeConfig::from_yaml("{}").unwrap();

    assert_eq!(config, RuntimeConfig::default());
    assert!(config.request_response.is_none());
}

#[test]
fn test_sections_override_defaults() {
    // Arrange
    let document = r#"
request_response:
  path: orders-responses
  timeout_ms: 5000
pending_requests:
  sweep_interval_ms: 250
outbox:
  poll_batch_size: 10
  message_cleanup:
    enabled: false
"#;

    // Act
    let config = RuntimeConfig::from_yaml(document).unwrap();

    // Assert
    let request_response = config.request_response.unwrap();
    assert_eq!(request_response.path, "orders-responses");
    assert_eq!(request_response.timeout, Duration::from_secs(5));
    assert_eq!(config.pending_requests.sweep_interval, Duration::from_millis(250));
    assert_eq!(config.outbox.poll_batch_size, 10);
    assert!(!config.outbox.message_cleanup.enabled);
    assert_eq!(config.outbox.lock_expiration, Duration::from_secs(10));
}

#[test]
fn test_invalid_values_fail_validation() {
    let result = RuntimeConfig::from_yaml(
        r#"
outbox:
  lock_expiration_ms: 1000
  lock_expiration_buffer_ms: 2000
"#,
    );

    assert!(matches!(
        result,
        Err(BusError::ConfigurationError(ConfigurationError::Invalid { .. }))
    ));
}

#[test]
fn test_malformed_values_are_parsing_errors() {
    let result = RuntimeConfig::from_yaml("outbox:\n  poll_batch_size: lots\n");

    assert!(matches!(
        result,
        Err(BusError::ConfigurationError(ConfigurationError::Parsing { .. }))
    ));
}

#[test]
fn test_load_reads_explicit_file() {
    let file = write_yaml("request_response:\n  path: replies\n");

    let config = RuntimeConfig::load(file.path().to_str()).unwrap();

    assert_eq!(
        config.request_response.map(|settings| settings.path),
        Some("replies".to_string())
    );
}

#[test]
fn test_load_requires_explicit_file_to_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.yaml");

    let result = RuntimeConfig::load(missing.to_str());

    assert!(matches!(
        result,
        Err(BusError::ConfigurationError(ConfigurationError::Parsing { .. }))
    ));
}

#[tokio::test]
async fn test_configure_enables_request_response_on_bus() {
    let config = RuntimeConfig::from_yaml("request_response:\n  path: replies\n").unwrap();

    let bus = config
        .configure(MessageBus::builder().transport(Arc::new(InMemoryTransport::new())))
        .build()
        .unwrap();

    assert_eq!(
        bus.request_response().map(|settings| settings.path.as_str()),
        Some("replies")
    );
    bus.dispose().await;
}
