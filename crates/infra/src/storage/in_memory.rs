use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use tidewater_core::{OwnerId, StreamId, VersionPolicy};
use tidewater_events::{Context, Event, State, Stream, StreamSnapshot};

use super::r#trait::{DeliveryGuarantee, Outbox, PendingBatch, Storage, StorageError};
use crate::codec::{Codec, CodecError, JsonCodec};

#[derive(Debug)]
struct Record {
    owner: Option<OwnerId>,
    version: u64,
    snapshot: Vec<u8>,
    journal: Vec<Event>,
}

#[derive(Debug, Default)]
struct Ledger {
    last_id: u64,
    batches: BTreeMap<u64, PendingBatch>,
}

/// In-memory stream storage with a journal and an outbox.
///
/// Intended for tests/dev. Snapshots are kept encoded with the configured
/// codec so that load always yields a fresh, independent stream instance.
#[derive(Debug)]
pub struct InMemoryStorage<S, C = JsonCodec> {
    name: String,
    codec: C,
    policy: VersionPolicy,
    records: RwLock<HashMap<StreamId, Record>>,
    outbox: Mutex<Ledger>,
    _state: PhantomData<fn() -> S>,
}

impl<S: State> InMemoryStorage<S> {
    pub fn new(stream_name: impl Into<String>) -> Result<Self, StorageError> {
        Self::with_codec(stream_name, JsonCodec::new())
    }
}

impl<S: State, C: Codec> InMemoryStorage<S, C> {
    pub fn with_codec(stream_name: impl Into<String>, codec: C) -> Result<Self, StorageError> {
        let name = stream_name.into();
        if name.trim().is_empty() {
            return Err(StorageError::InvalidStreamName);
        }
        Ok(Self {
            name,
            codec,
            policy: VersionPolicy::default(),
            records: RwLock::new(HashMap::new()),
            outbox: Mutex::new(Ledger::default()),
            _state: PhantomData,
        })
    }

    pub fn with_policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Last persisted version of a stream, if it exists.
    pub fn version_of(&self, id: StreamId) -> Result<Option<u64>, StorageError> {
        Ok(self.records()?.get(&id).map(|r| r.version))
    }

    /// Every event persisted for a stream, in append order.
    pub fn history(&self, id: StreamId) -> Result<Vec<Event>, StorageError> {
        let records = self.records()?;
        records
            .get(&id)
            .map(|r| r.journal.clone())
            .ok_or_else(|| self.not_found(id))
    }

    /// Rebuild a stream from its journal instead of its snapshot.
    pub fn replay(&self, id: StreamId) -> Result<Stream<S>, StorageError> {
        let records = self.records()?;
        let record = records.get(&id).ok_or_else(|| self.not_found(id))?;
        Stream::replay(self.name.clone(), id, record.owner, &record.journal, self.policy)
            .map_err(|e| StorageError::Codec(CodecError::Decode(e.to_string())))
    }

    /// Ids of every stored stream, in no particular order.
    pub fn ids(&self) -> Result<Vec<StreamId>, StorageError> {
        Ok(self.records()?.keys().copied().collect())
    }

    pub fn len(&self) -> usize {
        self.records().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<StreamId, Record>>, StorageError> {
        self.records
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))
    }

    fn ledger(&self) -> Result<std::sync::MutexGuard<'_, Ledger>, StorageError> {
        self.outbox
            .lock()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))
    }

    fn not_found(&self, id: StreamId) -> StorageError {
        StorageError::NotFound {
            name: self.name.clone(),
            id,
        }
    }

    fn check_name(&self, stream: &Stream<S>) -> Result<(), StorageError> {
        if stream.name() != self.name {
            return Err(StorageError::StreamNameMismatch {
                expected: self.name.clone(),
                found: stream.name().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<S: State, C: Codec> Storage<S> for InMemoryStorage<S, C> {
    fn stream_name(&self) -> &str {
        &self.name
    }

    fn blank_stream(&self) -> Stream<S> {
        Stream::blank(self.name.clone()).with_policy(self.policy)
    }

    async fn load(
        &self,
        _ctx: &Context,
        id: StreamId,
        owner: Option<OwnerId>,
    ) -> Result<Stream<S>, StorageError> {
        let records = self.records()?;
        let record = records.get(&id).ok_or_else(|| self.not_found(id))?;
        if owner.is_some() && record.owner != owner {
            return Err(self.not_found(id));
        }
        let snapshot: StreamSnapshot<S> = self.codec.decode(&record.snapshot)?;
        Ok(Stream::from_snapshot(snapshot, self.policy))
    }

    async fn persist(&self, _ctx: &Context, stream: &Stream<S>) -> Result<(), StorageError> {
        self.check_name(stream)?;
        // Encode before taking the lock so a codec failure leaves nothing behind.
        let snapshot = self.codec.encode(&stream.snapshot())?;

        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;

        let current = records.get(&stream.id()).map(|r| r.version).unwrap_or(0);
        if !stream.expected_version().matches(current) {
            return Err(StorageError::VersionConflict {
                name: self.name.clone(),
                id: stream.id(),
                expected: stream.previous_version(),
                found: current,
            });
        }

        let record = records.entry(stream.id()).or_insert_with(|| Record {
            owner: stream.owner(),
            version: 0,
            snapshot: Vec::new(),
            journal: Vec::new(),
        });
        record.version = stream.version();
        record.snapshot = snapshot;
        record.journal.extend_from_slice(stream.changes());

        tracing::debug!(
            stream = %self.name,
            stream_id = %stream.id(),
            version = stream.version(),
            events = stream.changes().len(),
            "stream persisted"
        );
        Ok(())
    }

    async fn mark_unpublished(
        &self,
        _ctx: &Context,
        stream: &Stream<S>,
    ) -> Result<(), StorageError> {
        self.check_name(stream)?;
        let mut ledger = self.ledger()?;
        ledger.last_id += 1;
        let id = ledger.last_id;
        ledger.batches.insert(
            id,
            PendingBatch {
                id,
                stream_name: self.name.clone(),
                stream_id: stream.id(),
                version: stream.version(),
                events: stream.changes().to_vec(),
                recorded_at: Utc::now(),
            },
        );
        tracing::warn!(
            stream = %self.name,
            stream_id = %stream.id(),
            version = stream.version(),
            batch = id,
            "events recorded for redelivery"
        );
        Ok(())
    }

    fn delivery(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::AtLeastOnce
    }
}

#[async_trait]
impl<S: State, C: Codec> Outbox for InMemoryStorage<S, C> {
    async fn pending(
        &self,
        _ctx: &Context,
        limit: usize,
    ) -> Result<Vec<PendingBatch>, StorageError> {
        Ok(self.ledger()?.batches.values().take(limit).cloned().collect())
    }

    async fn acknowledge(&self, _ctx: &Context, batch_id: u64) -> Result<(), StorageError> {
        self.ledger()?.batches.remove(&batch_id);
        Ok(())
    }
}
