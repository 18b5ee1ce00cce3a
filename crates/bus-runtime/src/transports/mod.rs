//! Transport implementations.
//!
//! Concrete broker bindings live outside this crate; the in-memory transport
//! serves tests and local development.

pub mod memory;

pub use memory::{InMemoryTransport, PathHandler};
