use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tidewater_core::{OwnerId, StreamId};
use tidewater_events::{Context, Event, State, Stream};

use crate::codec::CodecError;

/// Storage operation error.
///
/// These are **infrastructure errors** (lookup, concurrency, encoding,
/// backend) as opposed to domain errors returned by controllers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stream {name}/{id} not found")]
    NotFound { name: String, id: StreamId },

    #[error("version conflict on {name}/{id}: expected {expected}, found {found}")]
    VersionConflict {
        name: String,
        id: StreamId,
        expected: u64,
        found: u64,
    },

    #[error("storage holds {expected} streams, got {found}")]
    StreamNameMismatch { expected: String, found: String },

    #[error("stream name must not be empty")]
    InvalidStreamName,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}

/// What a storage promises about events whose publication failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryGuarantee {
    /// `mark_unpublished` records an outbox entry that a relay redelivers.
    AtLeastOnce,
    /// `mark_unpublished` is a no-op; failed publications are lost.
    BestEffort,
}

/// Versioned stream persistence with optimistic concurrency.
///
/// One storage instance is bound to one stream name.
///
/// ## Persist Semantics
///
/// `persist()` must atomically:
/// - verify the stored version equals `stream.previous_version()`
///   (compare-and-swap keyed by stream name + id)
/// - write the new snapshot and/or the pending events
/// - advance the stored version to `stream.version()`
///
/// On mismatch it fails with [`StorageError::VersionConflict`] without any
/// partial effect and without touching the passed stream.
///
/// ## Load Semantics
///
/// `load()` returns a stream whose `previous_version()` is the last persisted
/// version, or [`StorageError::NotFound`]. When `owner` is given, streams of
/// other owners are not visible.
///
/// ## Delivery
///
/// `mark_unpublished()` is the compensation hook invoked when persist
/// succeeded but publication failed. Implementations that record nothing
/// must report [`DeliveryGuarantee::BestEffort`].
#[async_trait]
pub trait Storage<S: State>: Send + Sync {
    fn stream_name(&self) -> &str;

    /// Empty stream of the bound type with a fresh id.
    fn blank_stream(&self) -> Stream<S>;

    async fn load(
        &self,
        ctx: &Context,
        id: StreamId,
        owner: Option<OwnerId>,
    ) -> Result<Stream<S>, StorageError>;

    async fn persist(&self, ctx: &Context, stream: &Stream<S>) -> Result<(), StorageError>;

    async fn mark_unpublished(&self, ctx: &Context, stream: &Stream<S>) -> Result<(), StorageError>;

    fn delivery(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::BestEffort
    }
}

#[async_trait]
impl<S, T> Storage<S> for Arc<T>
where
    S: State,
    T: Storage<S> + ?Sized,
{
    fn stream_name(&self) -> &str {
        (**self).stream_name()
    }

    fn blank_stream(&self) -> Stream<S> {
        (**self).blank_stream()
    }

    async fn load(
        &self,
        ctx: &Context,
        id: StreamId,
        owner: Option<OwnerId>,
    ) -> Result<Stream<S>, StorageError> {
        (**self).load(ctx, id, owner).await
    }

    async fn persist(&self, ctx: &Context, stream: &Stream<S>) -> Result<(), StorageError> {
        (**self).persist(ctx, stream).await
    }

    async fn mark_unpublished(
        &self,
        ctx: &Context,
        stream: &Stream<S>,
    ) -> Result<(), StorageError> {
        (**self).mark_unpublished(ctx, stream).await
    }

    fn delivery(&self) -> DeliveryGuarantee {
        (**self).delivery()
    }
}

/// Events that were persisted but not confirmed delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    /// Outbox sequence, increasing in recording order.
    pub id: u64,
    pub stream_name: String,
    pub stream_id: StreamId,
    /// Stream version the batch brings the stream to.
    pub version: u64,
    pub events: Vec<Event>,
    pub recorded_at: DateTime<Utc>,
}

/// Pending-publication ledger drained by a relay.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Oldest pending batches first, at most `limit`.
    async fn pending(&self, ctx: &Context, limit: usize) -> Result<Vec<PendingBatch>, StorageError>;

    /// Remove a batch once it has been delivered.
    async fn acknowledge(&self, ctx: &Context, batch_id: u64) -> Result<(), StorageError>;
}

#[async_trait]
impl<T> Outbox for Arc<T>
where
    T: Outbox + ?Sized,
{
    async fn pending(
        &self,
        ctx: &Context,
        limit: usize,
    ) -> Result<Vec<PendingBatch>, StorageError> {
        (**self).pending(ctx, limit).await
    }

    async fn acknowledge(&self, ctx: &Context, batch_id: u64) -> Result<(), StorageError> {
        (**self).acknowledge(ctx, batch_id).await
    }
}
