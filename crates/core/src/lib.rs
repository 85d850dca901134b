//! `tidewater-core`: primitives shared by the event engine and its adapters.
//!
//! This crate contains **pure** building blocks (no IO, no async runtime).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult, PayloadError};
pub use id::{CommandId, EventId, OwnerId, StreamId};
pub use version::{ExpectedVersion, VersionPolicy};
