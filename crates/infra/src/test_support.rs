//! Test doubles shared by the unit and pipeline tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tidewater_core::{OwnerId, PayloadError, StreamId};
use tidewater_events::{Context, Event, PublishError, Publisher, State, Stream};

use crate::storage::{DeliveryGuarantee, InMemoryStorage, Storage, StorageError};

/// Groups a user belongs to.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoined {
    pub group: String,
}

pub fn joined(group: &str) -> UserJoined {
    UserJoined {
        group: group.to_string(),
    }
}

impl State for Membership {
    fn apply(&mut self, event: &Event) -> Result<(), PayloadError> {
        match event.name() {
            "userJoined" => {
                let joined: UserJoined = event.decode()?;
                self.groups.push(joined.group);
                Ok(())
            }
            other => Err(PayloadError::unexpected(other)),
        }
    }
}

/// In-memory storage that counts calls and can be told to fail.
pub struct SpyStorage<S: State> {
    inner: Arc<InMemoryStorage<S>>,
    loads: Arc<AtomicUsize>,
    persists: Arc<AtomicUsize>,
    unpublished: Arc<AtomicUsize>,
    fail_persist: Arc<AtomicBool>,
    fail_mark: Arc<AtomicBool>,
}

impl<S: State> Clone for SpyStorage<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            loads: self.loads.clone(),
            persists: self.persists.clone(),
            unpublished: self.unpublished.clone(),
            fail_persist: self.fail_persist.clone(),
            fail_mark: self.fail_mark.clone(),
        }
    }
}

impl<S: State> SpyStorage<S> {
    pub fn new(stream_name: &str) -> Self {
        Self {
            inner: Arc::new(InMemoryStorage::new(stream_name).unwrap()),
            loads: Arc::default(),
            persists: Arc::default(),
            unpublished: Arc::default(),
            fail_persist: Arc::default(),
            fail_mark: Arc::default(),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryStorage<S>> {
        &self.inner
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn persist_calls(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn mark_unpublished_calls(&self) -> usize {
        self.unpublished.load(Ordering::SeqCst)
    }

    pub fn fail_persist(&self) {
        self.fail_persist.store(true, Ordering::SeqCst);
    }

    pub fn fail_mark_unpublished(&self) {
        self.fail_mark.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: State> Storage<S> for SpyStorage<S> {
    fn stream_name(&self) -> &str {
        self.inner.stream_name()
    }

    fn blank_stream(&self) -> Stream<S> {
        self.inner.blank_stream()
    }

    async fn load(
        &self,
        ctx: &Context,
        id: StreamId,
        owner: Option<OwnerId>,
    ) -> Result<Stream<S>, StorageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(ctx, id, owner).await
    }

    async fn persist(&self, ctx: &Context, stream: &Stream<S>) -> Result<(), StorageError> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".to_string()));
        }
        self.inner.persist(ctx, stream).await
    }

    async fn mark_unpublished(
        &self,
        ctx: &Context,
        stream: &Stream<S>,
    ) -> Result<(), StorageError> {
        self.unpublished.fetch_add(1, Ordering::SeqCst);
        if self.fail_mark.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("outbox unavailable".to_string()));
        }
        self.inner.mark_unpublished(ctx, stream).await
    }

    fn delivery(&self) -> DeliveryGuarantee {
        self.inner.delivery()
    }
}

/// Publisher that records batches and can fail a number of calls.
#[derive(Clone, Default)]
pub struct SpyPublisher {
    calls: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    published: Arc<Mutex<Vec<Event>>>,
}

impl SpyPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn publish_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for SpyPublisher {
    async fn publish(&self, _ctx: &Context, events: &[Event]) -> Result<(), PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(PublishError::Transport(anyhow!("broker unreachable")));
        }
        self.published.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}
