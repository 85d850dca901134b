//! Outbox relay: redelivers events whose publication failed after persist.

use thiserror::Error;

use tidewater_events::{Context, PublishError, Publisher};

use crate::config::RelayConfig;
use crate::storage::{Outbox, StorageError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("reading the outbox failed: {0}")]
    Outbox(#[from] StorageError),

    #[error("republishing batch {batch} failed: {source}")]
    Publish {
        batch: u64,
        #[source]
        source: PublishError,
    },
}

/// Drains an [`Outbox`] into a [`Publisher`].
///
/// Batches are republished oldest first and acknowledged one by one. A pass
/// stops at the first batch that fails to publish so that later batches of
/// the same stream are never delivered ahead of it.
#[derive(Debug)]
pub struct OutboxRelay<O, P> {
    outbox: O,
    publisher: P,
    config: RelayConfig,
}

impl<O: Outbox, P: Publisher> OutboxRelay<O, P> {
    pub fn new(outbox: O, publisher: P, config: RelayConfig) -> Self {
        Self {
            outbox,
            publisher,
            config,
        }
    }

    /// One pass over the pending batches. Returns how many were redelivered.
    pub async fn run_once(&self, ctx: &Context) -> Result<usize, RelayError> {
        let pending = self.outbox.pending(ctx, self.config.batch).await?;
        let mut delivered = 0;
        for batch in pending {
            if ctx.is_cancelled() {
                break;
            }
            self.publisher
                .publish(ctx, &batch.events)
                .await
                .map_err(|source| RelayError::Publish {
                    batch: batch.id,
                    source,
                })?;
            self.outbox.acknowledge(ctx, batch.id).await?;
            tracing::debug!(
                batch = batch.id,
                stream = %batch.stream_name,
                stream_id = %batch.stream_id,
                version = batch.version,
                "batch redelivered"
            );
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Run passes every `interval` until the context is cancelled.
    pub async fn run(&self, ctx: &Context) {
        tracing::info!(
            interval_ms = self.config.interval_ms,
            batch = self.config.batch,
            "outbox relay started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    match self.run_once(ctx).await {
                        Ok(0) => {}
                        Ok(delivered) => tracing::info!(delivered, "outbox batches redelivered"),
                        Err(err) => tracing::error!(error = %err, "outbox relay pass failed"),
                    }
                }
                _ = ctx.cancelled() => {
                    tracing::info!("outbox relay stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, Storage};
    use crate::test_support::{Membership, SpyPublisher, joined};
    use std::sync::Arc;
    use std::time::Duration;

    async fn storage_with_pending(batches: usize) -> Arc<InMemoryStorage<Membership>> {
        let storage = Arc::new(InMemoryStorage::<Membership>::new("user").unwrap());
        let ctx = Context::background();
        for i in 0..batches {
            let mut stream = storage.blank_stream();
            stream.mutate("userJoined", &joined(&format!("g{i}"))).unwrap();
            storage.persist(&ctx, &stream).await.unwrap();
            storage.mark_unpublished(&ctx, &stream).await.unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn run_once_republishes_and_acknowledges() {
        let storage = storage_with_pending(3).await;
        let publisher = SpyPublisher::new();
        let relay = OutboxRelay::new(storage.clone(), publisher.clone(), RelayConfig::default());
        let ctx = Context::background();

        assert_eq!(relay.run_once(&ctx).await.unwrap(), 3);
        assert_eq!(publisher.published().len(), 3);
        assert!(storage.pending(&ctx, 10).await.unwrap().is_empty());
        assert_eq!(relay.run_once(&ctx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_batch_stays_pending_and_stops_the_pass() {
        let storage = storage_with_pending(2).await;
        let publisher = SpyPublisher::new();
        publisher.fail_next(1);
        let relay = OutboxRelay::new(storage.clone(), publisher.clone(), RelayConfig::default());
        let ctx = Context::background();

        let err = relay.run_once(&ctx).await.unwrap_err();
        assert!(matches!(err, RelayError::Publish { batch: 1, .. }));
        assert_eq!(storage.pending(&ctx, 10).await.unwrap().len(), 2);

        assert_eq!(relay.run_once(&ctx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn batch_limit_bounds_a_pass() {
        let storage = storage_with_pending(3).await;
        let config = RelayConfig { interval_ms: 10, batch: 2 };
        let relay = OutboxRelay::new(storage.clone(), SpyPublisher::new(), config);
        assert_eq!(relay.run_once(&Context::background()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn run_drains_until_cancelled() {
        let storage = storage_with_pending(1).await;
        let publisher = SpyPublisher::new();
        let relay = Arc::new(OutboxRelay::new(
            storage.clone(),
            publisher.clone(),
            RelayConfig { interval_ms: 5, batch: 10 },
        ));
        let (ctx, cancel) = Context::with_cancel();
        let task = {
            let relay = relay.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { relay.run(&ctx).await })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while publisher.published().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay should redeliver the pending batch");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("relay should stop after cancellation")
            .unwrap();
    }
}
