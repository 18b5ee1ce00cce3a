//! Registry of in-flight requests keyed by request identifier.

use super::state::PendingRequestState;
use crate::error::BusError;
use crate::message::{RequestId, Timestamp};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Concurrent registry of pending requests
pub trait PendingRequestStore: Send + Sync {
    /// Register a request; fails if its identifier is already present
    fn add(&self, state: Arc<PendingRequestState>) -> Result<(), BusError>;

    /// Remove a request. Returns whether an entry was removed.
    fn remove(&self, id: &RequestId) -> bool;

    /// Look up a request
    fn get_by_id(&self, id: &RequestId) -> Option<Arc<PendingRequestState>>;

    /// All requests expired at `now` or whose cancellation was triggered
    fn find_all_to_cancel(&self, now: Timestamp) -> Vec<Arc<PendingRequestState>>;

    /// Remove every listed request
    fn remove_all(&self, ids: &[RequestId]);

    /// Number of pending requests
    fn count(&self) -> usize;
}

/// In-memory [`PendingRequestStore`]
#[derive(Debug, Default)]
pub struct InMemoryPendingRequestStore {
    items: RwLock<HashMap<RequestId, Arc<PendingRequestState>>>,
}

impl InMemoryPendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingRequestStore for InMemoryPendingRequestStore {
    fn add(&self, state: Arc<PendingRequestState>) -> Result<(), BusError> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        if items.contains_key(&state.id) {
            return Err(BusError::DuplicateRequest {
                request_id: state.id.to_string(),
            });
        }
        items.insert(state.id.clone(), state);
        Ok(())
    }

    fn remove(&self, id: &RequestId) -> bool {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    fn get_by_id(&self, id: &RequestId) -> Option<Arc<PendingRequestState>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn find_all_to_cancel(&self, now: Timestamp) -> Vec<Arc<PendingRequestState>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|state| state.is_due_for_cancellation(now))
            .cloned()
            .collect()
    }

    fn remove_all(&self, ids: &[RequestId]) {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            items.remove(id);
        }
    }

    fn count(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
