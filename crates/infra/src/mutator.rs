//! Mutation engine (application-level orchestration).
//!
//! This module implements the **command pipeline** and the **event pipeline**
//! for one stream type. Both end in the same commit protocol:
//!
//! ```text
//! Command                                 Event
//!   ↓                                       ↓
//! 1. Route (stream name, controller)      1. Denylist / route / pick targets
//!   ↓                                       ↓
//! 2. Load or create the stream            2. Load or create each target
//!   ↓                                       ↓
//! 3. Controller mutates the stream        3. Controller mutates the stream
//!   ↓                                       ↓
//!   └──────────────── commit ───────────────┘
//!   4. Persist (optimistic concurrency)
//!   5. Publish pending events
//!      └─ on failure: mark unpublished, report partial failure
//!   6. Clear pending events
//! ```
//!
//! Nothing is persisted before step 4, so every error before it leaves no
//! trace. After a successful persist the engine always attempts publication
//! and, if that fails, the storage compensation hook.
//!
//! The engine never retries. Retry policy belongs to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tidewater_core::DomainError;
use tidewater_events::{Command, Context, Event, PublishError, Publisher, Reply, State, Stream};

use crate::config::EngineConfig;
use crate::controller::{CommandController, EventController, Mode};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum MutationError {
    /// The command targets a different stream type than the engine serves.
    #[error("engine serves {expected} streams, command targets {found}")]
    StreamMismatch { expected: String, found: String },

    #[error("no controller registered for {0}")]
    ControllerNotFound(String),

    #[error("controller already registered for {0}")]
    DuplicateController(String),

    /// A load-mode command arrived without a stream id.
    #[error("command {0} does not name a stream id")]
    MissingStreamId(String),

    #[error("stream load failed: {0}")]
    LoadFailed(#[source] StorageError),

    /// Business validation failed; the stream was discarded.
    #[error("rejected: {0}")]
    Rejected(#[from] DomainError),

    #[error(transparent)]
    VersionConflict(StorageError),

    #[error("persist failed: {0}")]
    PersistFailed(#[source] StorageError),

    /// Events are durable but their delivery is not confirmed.
    #[error("events persisted but not published: {source}")]
    PublishFailed {
        #[source]
        source: PublishError,
        /// Set when recording the batch for redelivery failed as well.
        compensation: Option<StorageError>,
    },

    /// Strict mode: the event is on the engine's denylist.
    #[error("event {0} is produced by this engine")]
    SelfEvent(String),

    /// Strict mode: the controller picked no stream.
    #[error("no stream picked for event {0}")]
    NoStreamPicked(String),

    #[error("cancelled")]
    Cancelled,
}

impl MutationError {
    /// Durable-but-undelivered outcome.
    pub fn is_partial(&self) -> bool {
        matches!(self, MutationError::PublishFailed { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MutationError::VersionConflict(_))
    }
}

/// Entry point transports call with incoming commands.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn handle_command(
        &self,
        ctx: &Context,
        command: &Command,
    ) -> Result<Reply, MutationError>;
}

/// Entry point for events re-injected for cascading mutation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle_event(&self, ctx: &Context, event: &Event) -> Result<(), MutationError>;
}

#[async_trait]
impl<T: CommandSink + ?Sized> CommandSink for Arc<T> {
    async fn handle_command(
        &self,
        ctx: &Context,
        command: &Command,
    ) -> Result<Reply, MutationError> {
        (**self).handle_command(ctx, command).await
    }
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    async fn handle_event(&self, ctx: &Context, event: &Event) -> Result<(), MutationError> {
        (**self).handle_event(ctx, event).await
    }
}

struct Registered<C: ?Sized> {
    mode: Mode,
    controller: Arc<C>,
}

/// Collects controllers and options for a [`Mutator`].
///
/// Registration problems are reported by [`build`](MutatorBuilder::build).
pub struct MutatorBuilder<S: State, St, P> {
    storage: St,
    publisher: P,
    commands: HashMap<String, Registered<dyn CommandController<S>>>,
    events: HashMap<String, Registered<dyn EventController<S>>>,
    ignored: HashSet<String>,
    strict: bool,
    duplicate: Option<String>,
}

impl<S, St, P> MutatorBuilder<S, St, P>
where
    S: State,
    St: Storage<S>,
    P: Publisher,
{
    pub fn new(storage: St, publisher: P) -> Self {
        Self {
            storage,
            publisher,
            commands: HashMap::new(),
            events: HashMap::new(),
            ignored: HashSet::new(),
            strict: false,
            duplicate: None,
        }
    }

    /// Apply strictness and the event denylist from configuration.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.strict = config.strict;
        self.ignored.extend(config.ignored_events.iter().cloned());
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Never route these events (typically the engine's own output).
    pub fn ignore_events<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.ignored.extend(names.into_iter().map(Into::into));
        self
    }

    /// Controller for an existing stream.
    pub fn command(
        self,
        name: impl Into<String>,
        controller: impl CommandController<S> + 'static,
    ) -> Self {
        self.register_command(name.into(), Mode::Load, Arc::new(controller))
    }

    /// Controller that starts from a blank stream.
    pub fn command_create(
        self,
        name: impl Into<String>,
        controller: impl CommandController<S> + 'static,
    ) -> Self {
        self.register_command(name.into(), Mode::Create, Arc::new(controller))
    }

    pub fn event(
        self,
        name: impl Into<String>,
        controller: impl EventController<S> + 'static,
    ) -> Self {
        self.register_event(name.into(), Mode::Load, Arc::new(controller))
    }

    pub fn event_create(
        self,
        name: impl Into<String>,
        controller: impl EventController<S> + 'static,
    ) -> Self {
        self.register_event(name.into(), Mode::Create, Arc::new(controller))
    }

    fn register_command(
        mut self,
        name: String,
        mode: Mode,
        controller: Arc<dyn CommandController<S>>,
    ) -> Self {
        if self.commands.contains_key(&name) {
            self.duplicate.get_or_insert(name);
        } else {
            self.commands.insert(name, Registered { mode, controller });
        }
        self
    }

    fn register_event(
        mut self,
        name: String,
        mode: Mode,
        controller: Arc<dyn EventController<S>>,
    ) -> Self {
        if self.events.contains_key(&name) {
            self.duplicate.get_or_insert(name);
        } else {
            self.events.insert(name, Registered { mode, controller });
        }
        self
    }

    pub fn build(self) -> Result<Mutator<S, St, P>, MutationError> {
        if let Some(name) = self.duplicate {
            return Err(MutationError::DuplicateController(name));
        }
        let stream_name = self.storage.stream_name().to_string();
        tracing::debug!(
            stream = %stream_name,
            commands = self.commands.len(),
            events = self.events.len(),
            strict = self.strict,
            "mutator built"
        );
        Ok(Mutator {
            stream_name,
            storage: self.storage,
            publisher: self.publisher,
            commands: self.commands,
            events: self.events,
            ignored: self.ignored,
            strict: self.strict,
        })
    }
}

/// Mutation engine bound to one stream type.
///
/// ## Generic Parameters
///
/// - `S`: the stream state
/// - `St`: storage implementation (must implement [`Storage`])
/// - `P`: publisher implementation (must implement [`Publisher`])
///
/// An invocation runs start to finish on the caller's task, suspending only
/// on storage and publisher calls. Concurrent invocations on the same stream
/// are arbitrated by the storage's version check: the loser gets
/// [`MutationError::VersionConflict`].
pub struct Mutator<S: State, St, P> {
    stream_name: String,
    storage: St,
    publisher: P,
    commands: HashMap<String, Registered<dyn CommandController<S>>>,
    events: HashMap<String, Registered<dyn EventController<S>>>,
    ignored: HashSet<String>,
    strict: bool,
}

impl<S, St, P> Mutator<S, St, P>
where
    S: State,
    St: Storage<S>,
    P: Publisher,
{
    pub fn builder(storage: St, publisher: P) -> MutatorBuilder<S, St, P> {
        MutatorBuilder::new(storage, publisher)
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn storage(&self) -> &St {
        &self.storage
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    async fn open(
        &self,
        ctx: &Context,
        mode: Mode,
        target: Option<tidewater_core::StreamId>,
        owner: Option<tidewater_core::OwnerId>,
        subject: &str,
    ) -> Result<Stream<S>, MutationError> {
        match mode {
            Mode::Create => {
                let mut stream = self.storage.blank_stream();
                let id = target.unwrap_or_else(|| stream.id());
                stream.assign(id, owner);
                Ok(stream)
            }
            Mode::Load => {
                let id = target.ok_or_else(|| MutationError::MissingStreamId(subject.to_string()))?;
                self.storage
                    .load(ctx, id, owner)
                    .await
                    .map_err(MutationError::LoadFailed)
            }
        }
    }

    /// Persist, publish and clear the stream's pending events.
    async fn commit(&self, ctx: &Context, stream: &mut Stream<S>) -> Result<(), MutationError> {
        if !stream.has_changes() {
            tracing::debug!(
                stream = %self.stream_name,
                stream_id = %stream.id(),
                "no changes, nothing to commit"
            );
            return Ok(());
        }
        if ctx.is_cancelled() {
            return Err(MutationError::Cancelled);
        }

        self.storage.persist(ctx, stream).await.map_err(|e| {
            if e.is_conflict() {
                MutationError::VersionConflict(e)
            } else {
                MutationError::PersistFailed(e)
            }
        })?;

        if let Err(source) = self.publisher.publish(ctx, stream.changes()).await {
            tracing::warn!(
                stream = %self.stream_name,
                stream_id = %stream.id(),
                version = stream.version(),
                error = %source,
                "publish failed after persist"
            );
            let compensation = match self.storage.mark_unpublished(ctx, stream).await {
                Ok(()) => None,
                Err(err) => {
                    tracing::error!(
                        stream = %self.stream_name,
                        stream_id = %stream.id(),
                        error = %err,
                        "could not record unpublished events"
                    );
                    Some(err)
                }
            };
            return Err(MutationError::PublishFailed { source, compensation });
        }

        tracing::debug!(
            stream = %self.stream_name,
            stream_id = %stream.id(),
            version = stream.version(),
            events = stream.changes().len(),
            "stream committed"
        );
        stream.clear_changes();
        Ok(())
    }
}

#[async_trait]
impl<S, St, P> CommandSink for Mutator<S, St, P>
where
    S: State,
    St: Storage<S>,
    P: Publisher,
{
    async fn handle_command(
        &self,
        ctx: &Context,
        command: &Command,
    ) -> Result<Reply, MutationError> {
        if ctx.is_cancelled() {
            return Err(MutationError::Cancelled);
        }
        if command.stream_name() != self.stream_name {
            return Err(MutationError::StreamMismatch {
                expected: self.stream_name.clone(),
                found: command.stream_name().to_string(),
            });
        }
        let registered = self
            .commands
            .get(command.name())
            .ok_or_else(|| MutationError::ControllerNotFound(command.name().to_string()))?;

        let mut stream = self
            .open(ctx, registered.mode, command.stream_id(), command.owner(), command.name())
            .await?;

        let reply = registered.controller.handle(ctx, &mut stream, command).await?;
        let reply = reply.unwrap_or_else(|| command.reply_ok(stream.version()));

        self.commit(ctx, &mut stream).await?;
        Ok(reply)
    }
}

#[async_trait]
impl<S, St, P> EventSink for Mutator<S, St, P>
where
    S: State,
    St: Storage<S>,
    P: Publisher,
{
    async fn handle_event(&self, ctx: &Context, event: &Event) -> Result<(), MutationError> {
        if ctx.is_cancelled() {
            return Err(MutationError::Cancelled);
        }
        if self.ignored.contains(event.name()) {
            if self.strict {
                return Err(MutationError::SelfEvent(event.name().to_string()));
            }
            tracing::debug!(event = event.name(), "ignoring denylisted event");
            return Ok(());
        }
        let Some(registered) = self.events.get(event.name()) else {
            if self.strict {
                return Err(MutationError::ControllerNotFound(event.name().to_string()));
            }
            return Ok(());
        };

        let targets = registered.controller.pick(event).into_ids();
        if targets.is_empty() {
            if self.strict {
                return Err(MutationError::NoStreamPicked(event.name().to_string()));
            }
            tracing::debug!(event = event.name(), "no stream picked");
            return Ok(());
        }

        // Fail-fast: the first failing target aborts the remaining ones.
        for id in targets {
            let mut stream = self
                .open(ctx, registered.mode, Some(id), event.owner(), event.name())
                .await?;
            registered.controller.handle(ctx, &mut stream, event).await?;
            self.commit(ctx, &mut stream).await?;
        }
        Ok(())
    }
}
