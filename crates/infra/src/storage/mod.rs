//! Stream storage boundary.
//!
//! This module defines the storage port the mutation engine persists through,
//! the outbox port a relay drains, and an in-memory implementation of both.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryStorage;
pub use r#trait::{DeliveryGuarantee, Outbox, PendingBatch, Storage, StorageError};
