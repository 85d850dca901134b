//! Event publishing and handling abstraction (mechanics only).
//!
//! This module provides the **publisher port** used by the mutation engine and
//! the **handler contract** used by event buses to deliver events to
//! consumers (projections, sinks, workers, etc.).
//!
//! ## Design Philosophy
//!
//! - **Storage first**: events are persisted before they are published; the
//!   storage is the source of truth and publication is best-effort distribution.
//! - **Transport-agnostic**: in-process lanes, brokers, queues. The engine only
//!   sees [`Publisher`].
//! - **At-least-once delivery**: a batch whose publication failed is marked
//!   unpublished and re-delivered later, so handlers must be idempotent.
//! - **Per-stream ordering**: implementations route by stream so that the
//!   events of one stream are handled in version order.
//!
//! ## Handler failures
//!
//! Handler errors are never returned to the publisher. Buses report them to an
//! [`ErrorObserver`] and ask the handlers that already ran to roll back.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::Context;
use crate::event::Event;

/// Failure to hand a batch to the transport.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No subscription exists for the events' stream name.
    #[error("no topic registered for stream {0}")]
    TopicNotFound(String),

    /// The bus was closed before or during publication.
    #[error("publisher is closed")]
    Closed,

    /// The context was cancelled while waiting for capacity.
    #[error("publication cancelled")]
    Cancelled,

    /// Transport-specific failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Delivers persisted events to consumers.
///
/// ## Contract
///
/// - `publish` either hands the whole batch to the transport or returns an
///   error. Partial delivery is reported as an error; the caller treats the
///   batch as unpublished and relies on re-delivery.
/// - Events of one stream must be published in version order.
/// - An empty batch is a no-op.
///
/// ## Thread Safety
///
/// Implementations are shared across tasks (`Send + Sync`). Multiple tasks
/// can publish concurrently; ordering is only guaranteed per stream.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, events: &[Event]) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish(&self, ctx: &Context, events: &[Event]) -> Result<(), PublishError> {
        (**self).publish(ctx, events).await
    }
}

/// A consumer of published events.
///
/// ## Lifecycle
///
/// For each event, a bus asks every registered handler whether it
/// [`matches`](EventHandler::matches) the event, then calls
/// [`handle`](EventHandler::handle) on the matching ones in registration order.
/// When one of them fails, the bus stops and calls
/// [`rollback`](EventHandler::rollback) on the matching handlers up to and
/// including the failed one, in reverse order.
///
/// ## Idempotency
///
/// Delivery is at-least-once. Handlers must tolerate duplicates; wrap them in
/// [`Deduplicated`](crate::handler::Deduplicated) when they cannot.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Whether this handler wants the event at all.
    fn matches(&self, event: &Event) -> bool;

    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()>;

    /// Undo the effects of `handle` for this event. No-op by default.
    async fn rollback(&self, _ctx: &Context, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    fn matches(&self, event: &Event) -> bool {
        (**self).matches(event)
    }

    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        (**self).handle(ctx, event).await
    }

    async fn rollback(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        (**self).rollback(ctx, event).await
    }
}

/// Asynchronous handler failure, reported to an [`ErrorObserver`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler #{index} failed on {event}: {source}")]
    Handler {
        index: usize,
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("rollback of handler #{index} failed on {event}: {source}")]
    Rollback {
        index: usize,
        event: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    pub fn index(&self) -> usize {
        match self {
            DispatchError::Handler { index, .. } | DispatchError::Rollback { index, .. } => *index,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, DispatchError::Rollback { .. })
    }
}

/// Sink for handler failures that happen after `publish` has returned.
pub trait ErrorObserver: Send + Sync {
    fn observe(&self, error: DispatchError);
}

impl<F> ErrorObserver for F
where
    F: Fn(DispatchError) + Send + Sync,
{
    fn observe(&self, error: DispatchError) {
        self(error)
    }
}

/// Default observer: logs every failure at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ErrorObserver for TracingObserver {
    fn observe(&self, error: DispatchError) {
        tracing::warn!(
            handler = error.index(),
            rollback = error.is_rollback(),
            error = %error,
            "event handler failed"
        );
    }
}
