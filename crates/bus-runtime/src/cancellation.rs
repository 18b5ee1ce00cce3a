//! Cooperative cancellation signal shared between callers and background loops.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation signal.
///
/// All clones observe the same state; once cancelled a token stays cancelled.
///
/// # Example
///
/// ```rust
/// use bus_runtime::cancellation::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let token = CancellationToken::new();
/// let observer = token.clone();
///
/// token.cancel();
/// observer.cancelled().await;
/// assert!(observer.is_cancelled());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Signal cancellation to every clone of this token
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so waiting cannot fail.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
