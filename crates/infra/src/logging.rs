//! Tracing decorators for sinks and handlers.

use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use tidewater_events::{Command, Context, Event, EventHandler, Reply};

use crate::mutator::{CommandSink, EventSink, MutationError};

/// Wraps a [`CommandSink`], [`EventSink`] or [`EventHandler`] and records
/// every call with its outcome and duration.
#[derive(Debug, Clone)]
pub struct Logged<T> {
    inner: T,
    label: &'static str,
}

impl<T> Logged<T> {
    pub fn new(inner: T) -> Self {
        Self::labelled(inner, "tidewater")
    }

    /// Name reported as `component` on every record.
    pub fn labelled(inner: T, label: &'static str) -> Self {
        Self { inner, label }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: CommandSink> CommandSink for Logged<T> {
    async fn handle_command(
        &self,
        ctx: &Context,
        command: &Command,
    ) -> Result<Reply, MutationError> {
        let span = tracing::info_span!(
            "command",
            component = self.label,
            command = command.name(),
            command_id = %command.id(),
            stream = command.stream_name(),
        );
        let started = Instant::now();
        let result = self.inner.handle_command(ctx, command).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        span.in_scope(|| match &result {
            Ok(reply) => tracing::info!(version = reply.version(), elapsed_ms, "command handled"),
            Err(err) if err.is_partial() => {
                tracing::error!(error = %err, elapsed_ms, "command persisted but not delivered")
            }
            Err(err) => tracing::warn!(error = %err, elapsed_ms, "command failed"),
        });
        result
    }
}

#[async_trait]
impl<T: EventSink> EventSink for Logged<T> {
    async fn handle_event(&self, ctx: &Context, event: &Event) -> Result<(), MutationError> {
        let span = tracing::info_span!(
            "event",
            component = self.label,
            event = event.name(),
            event_id = %event.id(),
            stream = event.stream_name(),
            version = event.version(),
        );
        let started = Instant::now();
        let result = self.inner.handle_event(ctx, event).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        span.in_scope(|| match &result {
            Ok(()) => tracing::debug!(elapsed_ms, "event handled"),
            Err(err) => tracing::warn!(error = %err, elapsed_ms, "event failed"),
        });
        result
    }
}

#[async_trait]
impl<T: EventHandler> EventHandler for Logged<T> {
    fn matches(&self, event: &Event) -> bool {
        self.inner.matches(event)
    }

    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = self.inner.handle(ctx, event).await;
        tracing::debug!(
            component = self.label,
            event = event.name(),
            stream_id = %event.stream_id(),
            version = event.version(),
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "handler ran"
        );
        result
    }

    async fn rollback(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        let result = self.inner.rollback(ctx, event).await;
        tracing::info!(
            component = self.label,
            event = event.name(),
            stream_id = %event.stream_id(),
            ok = result.is_ok(),
            "handler rolled back"
        );
        result
    }
}
