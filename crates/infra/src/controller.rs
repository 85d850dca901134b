//! Business logic bound to command and event names.
//!
//! Controllers are the only code that mutates streams. A command controller
//! validates a command against the current state and appends events; an event
//! controller reacts to an event published by some stream by mutating the
//! stream(s) it picks.

use async_trait::async_trait;

use tidewater_core::{DomainResult, StreamId};
use tidewater_events::{Command, Context, Event, Reply, State, Stream};

/// How the engine obtains the stream a controller runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Load the existing stream; a missing stream is an error.
    #[default]
    Load,
    /// Start from a blank stream carrying the target id.
    Create,
}

#[async_trait]
pub trait CommandController<S: State>: Send + Sync {
    /// Validate `command` and mutate `stream`.
    ///
    /// Returning `Ok(None)` lets the engine reply with the stream version.
    /// An error discards the stream; nothing is persisted.
    async fn handle(
        &self,
        ctx: &Context,
        stream: &mut Stream<S>,
        command: &Command,
    ) -> DomainResult<Option<Reply>>;
}

/// Target streams of an incoming event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Pick {
    #[default]
    None,
    One(StreamId),
    Many(Vec<StreamId>),
}

impl Pick {
    pub fn into_ids(self) -> Vec<StreamId> {
        match self {
            Pick::None => Vec::new(),
            Pick::One(id) => vec![id],
            Pick::Many(ids) => ids,
        }
    }
}

impl From<Option<StreamId>> for Pick {
    fn from(value: Option<StreamId>) -> Self {
        value.map_or(Pick::None, Pick::One)
    }
}

impl From<Vec<StreamId>> for Pick {
    fn from(value: Vec<StreamId>) -> Self {
        Pick::Many(value)
    }
}

#[async_trait]
pub trait EventController<S: State>: Send + Sync {
    /// Which streams of the bound type the event applies to.
    fn pick(&self, event: &Event) -> Pick;

    async fn handle(
        &self,
        ctx: &Context,
        stream: &mut Stream<S>,
        event: &Event,
    ) -> DomainResult<()>;
}

/// Closure-backed [`CommandController`]; see [`command_fn`].
pub struct CommandFn<F>(F);

/// Wrap a synchronous closure as a command controller.
pub fn command_fn<S, F>(f: F) -> CommandFn<F>
where
    S: State,
    F: Fn(&mut Stream<S>, &Command) -> DomainResult<Option<Reply>> + Send + Sync,
{
    CommandFn(f)
}

#[async_trait]
impl<S, F> CommandController<S> for CommandFn<F>
where
    S: State,
    F: Fn(&mut Stream<S>, &Command) -> DomainResult<Option<Reply>> + Send + Sync,
{
    async fn handle(
        &self,
        _ctx: &Context,
        stream: &mut Stream<S>,
        command: &Command,
    ) -> DomainResult<Option<Reply>> {
        (self.0)(stream, command)
    }
}

/// Closure-backed [`EventController`]; see [`event_fn`].
pub struct EventFn<P, F> {
    pick: P,
    handle: F,
}

/// Wrap a pick closure and a synchronous handler closure as an event controller.
pub fn event_fn<S, P, F>(pick: P, handle: F) -> EventFn<P, F>
where
    S: State,
    P: Fn(&Event) -> Pick + Send + Sync,
    F: Fn(&mut Stream<S>, &Event) -> DomainResult<()> + Send + Sync,
{
    EventFn { pick, handle }
}

#[async_trait]
impl<S, P, F> EventController<S> for EventFn<P, F>
where
    S: State,
    P: Fn(&Event) -> Pick + Send + Sync,
    F: Fn(&mut Stream<S>, &Event) -> DomainResult<()> + Send + Sync,
{
    fn pick(&self, event: &Event) -> Pick {
        (self.pick)(event)
    }

    async fn handle(
        &self,
        _ctx: &Context,
        stream: &mut Stream<S>,
        event: &Event,
    ) -> DomainResult<()> {
        (self.handle)(stream, event)
    }
}
