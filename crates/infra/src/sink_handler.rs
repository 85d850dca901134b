//! Bus handler that feeds events back into a mutation engine.

use std::collections::HashSet;

use async_trait::async_trait;

use tidewater_events::{Context, Event, EventHandler};

use crate::mutator::EventSink;

/// Forwards matching events to an [`EventSink`] (cascading consistency).
///
/// With no event names every event on the subscribed topic is forwarded.
#[derive(Debug)]
pub struct SinkHandler<E> {
    sink: E,
    names: HashSet<String>,
}

impl<E: EventSink> SinkHandler<E> {
    pub fn new(sink: E) -> Self {
        Self {
            sink,
            names: HashSet::new(),
        }
    }

    pub fn on<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl<E: EventSink> EventHandler for SinkHandler<E> {
    fn matches(&self, event: &Event) -> bool {
        self.names.is_empty() || self.names.contains(event.name())
    }

    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        self.sink.handle_event(ctx, event).await?;
        Ok(())
    }
}
