//! Request/response correlation state.
//!
//! - [`state`] - pending request entries and their single-assignment completion slot
//! - [`store`] - concurrent registry keyed by request identifier
//! - [`manager`] - periodic sweeper expiring and cancelling entries

pub mod manager;
pub mod state;
pub mod store;

pub use manager::{PendingRequestManager, TimeoutCallback, DEFAULT_SWEEP_INTERVAL};
pub use state::{CancelReason, CompletionSlot, PendingRequestState, RequestOutcome};
pub use store::{InMemoryPendingRequestStore, PendingRequestStore};
