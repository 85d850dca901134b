//! Streams, events, commands and the in-process partitioned event bus.

pub mod bus;
pub mod command;
pub mod context;
pub mod event;
pub mod handler;
pub mod hash;
pub mod partitioned_bus;
pub mod stream;

pub use bus::{
    DispatchError, ErrorObserver, EventHandler, PublishError, Publisher, TracingObserver,
};
pub use command::{Command, Reply};
pub use context::{CancelHandle, Context};
pub use event::Event;
pub use handler::{Deduplicated, Deduplicator, HandlerFn, InMemoryDeduplicator, Projection};
pub use partitioned_bus::{BusConfig, BusError, PartitionedBus};
pub use stream::{State, Stream, StreamSnapshot};
