//! Common test utilities for bus-runtime integration tests
//!
//! This module provides:
//! - Log capture through `tracing-subscriber`, filtered by `RUST_LOG`
//! - A responder answering requests on a path with a caller-supplied function
//! - Polling helpers for background work

use bus_runtime::{
    headers, CancellationToken, Headers, InMemoryTransport, MessageBus, MessageType, MessageValue,
    TransportMessage,
};
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a test writer subscriber once per test binary
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "bus_runtime=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Route responses produced to `reply_path` back into `bus`
#[allow(dead_code)]
pub fn route_responses(transport: &InMemoryTransport, reply_path: &str, bus: &Arc<MessageBus>) {
    let bus = Arc::downgrade(bus);
    transport.on_path(
        reply_path,
        Arc::new(move |message: TransportMessage| {
            if let Some(bus) = bus.upgrade() {
                bus.on_response_message_arrived(&message.payload, &message.path, &message.headers);
            }
        }),
    );
}

/// Answer every request produced to `path` through `server`.
///
/// `respond` receives the request message and returns the response message or
/// an error reported back to the requester. `None` leaves the request unanswered.
#[allow(dead_code)]
pub fn serve<F>(
    transport: &InMemoryTransport,
    path: &str,
    server: &Arc<MessageBus>,
    response_type: MessageType,
    respond: F,
) where
    F: Fn(MessageValue) -> Option<Result<MessageValue, String>> + Send + Sync + 'static,
{
    let server = Arc::downgrade(server);
    let respond = Arc::new(respond);
    transport.on_path(
        path,
        Arc::new(move |message: TransportMessage| {
            let Some(server) = server.upgrade() else {
                return;
            };
            let respond = Arc::clone(&respond);
            let response_type = response_type.clone();
            tokio::spawn(async move {
                let request: MessageValue = serde_json::from_slice(&message.payload).unwrap();
                if let Some(response) = respond(request) {
                    server
                        .produce_response(
                            &message.headers,
                            &response_type,
                            response,
                            &CancellationToken::new(),
                        )
                        .await
                        .unwrap();
                }
            });
        }),
    );
}

/// Request id header of a produced message
#[allow(dead_code)]
pub fn request_id(message_headers: &Headers) -> Option<&str> {
    message_headers.get(headers::REQUEST_ID).map(String::as_str)
}

/// Poll `condition` until it holds or five seconds pass
#[allow(dead_code)]
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
