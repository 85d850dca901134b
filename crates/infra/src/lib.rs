//! Infrastructure layer: storage, mutation engine, relay, config.

pub mod codec;
pub mod config;
pub mod controller;
pub mod logging;
pub mod mutator;
pub mod relay;
pub mod sink_handler;
pub mod storage;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_support;

pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{ConfigError, EngineConfig, RelayConfig, Settings};
pub use controller::{
    CommandController, CommandFn, EventController, EventFn, Mode, Pick, command_fn, event_fn,
};
pub use logging::Logged;
pub use mutator::{CommandSink, EventSink, MutationError, Mutator, MutatorBuilder};
pub use relay::{OutboxRelay, RelayError};
pub use sink_handler::SinkHandler;
pub use storage::{DeliveryGuarantee, InMemoryStorage, Outbox, PendingBatch, Storage, StorageError};
