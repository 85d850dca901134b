//! Ready-made [`EventHandler`] implementations.
//!
//! - [`HandlerFn`]: a closure (plus optional rollback closure) bound to a set
//!   of event names.
//! - [`Projection`]: a read-model builder keyed by event name.
//! - [`Deduplicated`]: wraps any handler so redelivered events are skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;

use tidewater_core::EventId;

use crate::bus::EventHandler;
use crate::context::Context;
use crate::event::Event;

type EventFn = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Closure-backed handler.
///
/// With no event names it matches every event delivered on its topic.
pub struct HandlerFn {
    names: HashSet<String>,
    handle: EventFn,
    rollback: Option<EventFn>,
}

impl HandlerFn {
    pub fn new<F>(handle: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            names: HashSet::new(),
            handle: Box::new(handle),
            rollback: None,
        }
    }

    /// Restrict the handler to the given event names.
    pub fn on<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.rollback = Some(Box::new(rollback));
        self
    }
}

impl core::fmt::Debug for HandlerFn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerFn")
            .field("names", &self.names)
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

#[async_trait]
impl EventHandler for HandlerFn {
    fn matches(&self, event: &Event) -> bool {
        self.names.is_empty() || self.names.contains(event.name())
    }

    async fn handle(&self, _ctx: &Context, event: &Event) -> anyhow::Result<()> {
        (self.handle)(event)
    }

    async fn rollback(&self, _ctx: &Context, event: &Event) -> anyhow::Result<()> {
        match &self.rollback {
            Some(rollback) => rollback(event),
            None => Ok(()),
        }
    }
}

struct ProjectionEntry {
    handle: EventFn,
    rollback: Option<EventFn>,
}

/// Read-model builder keyed by event name.
///
/// A projection is **strict** by default: asking it to handle (or roll back)
/// an event it has no entry for is an error. Call
/// [`skip_unhandled`](Projection::skip_unhandled) to ignore such events instead.
///
/// The bus only delivers events whose name has an entry, so strictness only
/// matters when the projection is driven directly (replays, tests).
pub struct Projection {
    entries: HashMap<String, ProjectionEntry>,
    strict: bool,
}

impl Projection {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            strict: true,
        }
    }

    pub fn skip_unhandled(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn on<F>(mut self, event_name: impl Into<String>, handle: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(
            event_name.into(),
            ProjectionEntry {
                handle: Box::new(handle),
                rollback: None,
            },
        );
        self
    }

    pub fn on_with_rollback<F, R>(
        mut self,
        event_name: impl Into<String>,
        handle: F,
        rollback: R,
    ) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
        R: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(
            event_name.into(),
            ProjectionEntry {
                handle: Box::new(handle),
                rollback: Some(Box::new(rollback)),
            },
        );
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    fn entry(&self, event: &Event, action: &str) -> anyhow::Result<Option<&ProjectionEntry>> {
        match self.entries.get(event.name()) {
            Some(entry) => Ok(Some(entry)),
            None if self.strict => Err(anyhow!(
                "no projection {action} for event {}",
                event.name()
            )),
            None => Ok(None),
        }
    }
}

impl Default for Projection {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Projection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Projection")
            .field("events", &self.entries.keys().collect::<Vec<_>>())
            .field("strict", &self.strict)
            .finish()
    }
}

#[async_trait]
impl EventHandler for Projection {
    fn matches(&self, event: &Event) -> bool {
        self.entries.contains_key(event.name())
    }

    async fn handle(&self, _ctx: &Context, event: &Event) -> anyhow::Result<()> {
        match self.entry(event, "handler")? {
            Some(entry) => (entry.handle)(event),
            None => Ok(()),
        }
    }

    async fn rollback(&self, _ctx: &Context, event: &Event) -> anyhow::Result<()> {
        match self.entry(event, "rollback")? {
            Some(ProjectionEntry {
                rollback: Some(rollback),
                ..
            }) => rollback(event),
            _ => Ok(()),
        }
    }
}

/// Remembers which events a handler has already processed.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    async fn has_visited(&self, ctx: &Context, event: &Event) -> anyhow::Result<bool>;

    async fn mark_visited(&self, ctx: &Context, event: &Event) -> anyhow::Result<()>;

    /// Forget an event so a later redelivery is processed again.
    async fn forget(&self, ctx: &Context, event: &Event) -> anyhow::Result<()>;
}

/// Process-local set of visited event ids.
#[derive(Debug, Default)]
pub struct InMemoryDeduplicator {
    visited: Mutex<HashSet<EventId>>,
}

impl InMemoryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    fn visited(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashSet<EventId>>> {
        self.visited
            .lock()
            .map_err(|_| anyhow!("deduplicator lock poisoned"))
    }
}

#[async_trait]
impl Deduplicator for InMemoryDeduplicator {
    async fn has_visited(&self, _ctx: &Context, event: &Event) -> anyhow::Result<bool> {
        Ok(self.visited()?.contains(&event.id()))
    }

    async fn mark_visited(&self, _ctx: &Context, event: &Event) -> anyhow::Result<()> {
        self.visited()?.insert(event.id());
        Ok(())
    }

    async fn forget(&self, _ctx: &Context, event: &Event) -> anyhow::Result<()> {
        self.visited()?.remove(&event.id());
        Ok(())
    }
}

/// Skips events the inner handler has already processed.
///
/// An event is marked visited only after the inner handler succeeded.
/// Rolling back forgets the event before forwarding the rollback.
#[derive(Debug)]
pub struct Deduplicated<H, D = InMemoryDeduplicator> {
    inner: H,
    dedup: D,
}

impl<H: EventHandler> Deduplicated<H> {
    pub fn new(inner: H) -> Self {
        Self::with_deduplicator(inner, InMemoryDeduplicator::new())
    }
}

impl<H: EventHandler, D: Deduplicator> Deduplicated<H, D> {
    pub fn with_deduplicator(inner: H, dedup: D) -> Self {
        Self { inner, dedup }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: EventHandler, D: Deduplicator> EventHandler for Deduplicated<H, D> {
    fn matches(&self, event: &Event) -> bool {
        self.inner.matches(event)
    }

    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        if self.dedup.has_visited(ctx, event).await? {
            tracing::debug!(
                event_id = %event.id(),
                event = event.name(),
                "skipping redelivered event"
            );
            return Ok(());
        }
        self.inner.handle(ctx, event).await?;
        self.dedup.mark_visited(ctx, event).await
    }

    async fn rollback(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        self.dedup.forget(ctx, event).await?;
        self.inner.rollback(ctx, event).await
    }
}
