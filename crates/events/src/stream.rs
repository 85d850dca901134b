//! Event-sourced stream (aggregate) entity.
//!
//! A [`Stream`] carries identity, a user-supplied [`State`], the version that
//! was last persisted, and the events appended since it was loaded
//! ("changes"). Its version is derived, never stored on its own:
//!
//! ```text
//! version() == previous_version() + changes().len()
//! ```
//!
//! A stream instance has exactly one logical owner for the duration of one
//! command or event-sink invocation and is discarded afterwards.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tidewater_core::{ExpectedVersion, OwnerId, PayloadError, StreamId, VersionPolicy};

use crate::event::{Event, encode_payload};

/// User state folded from a stream's events.
///
/// `Default` provides the blank state of a new stream; serde provides the
/// snapshot form used by storage adapters.
pub trait State: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fold one event into the state.
    ///
    /// Return [`PayloadError::Unexpected`] (or the decode error) for events
    /// whose payload this state does not understand.
    fn apply(&mut self, event: &Event) -> Result<(), PayloadError>;
}

#[derive(Debug)]
pub struct Stream<S> {
    id: StreamId,
    name: String,
    owner: Option<OwnerId>,
    /// Last persisted version.
    version: u64,
    updated_at: DateTime<Utc>,
    state: S,
    changes: Vec<Event>,
    policy: VersionPolicy,
}

/// Serializable form of a stream without its pending changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot<S> {
    pub id: StreamId,
    pub name: String,
    pub owner: Option<OwnerId>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub state: S,
}

impl<S: State> Stream<S> {
    pub fn new(name: impl Into<String>, id: StreamId, state: S) -> Self {
        Self {
            id,
            name: name.into(),
            owner: None,
            version: 0,
            updated_at: Utc::now(),
            state,
            changes: Vec::new(),
            policy: VersionPolicy::default(),
        }
    }

    /// A new stream with a fresh id and the default state.
    pub fn blank(name: impl Into<String>) -> Self {
        Self::new(name, StreamId::new(), S::default())
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restore a stream from its persisted snapshot.
    pub fn from_snapshot(snapshot: StreamSnapshot<S>, policy: VersionPolicy) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name,
            owner: snapshot.owner,
            version: snapshot.version,
            updated_at: snapshot.updated_at,
            state: snapshot.state,
            changes: Vec::new(),
            policy,
        }
    }

    /// Rebuild a stream by folding a journal of events into a blank state.
    pub fn replay<'a>(
        name: impl Into<String>,
        id: StreamId,
        owner: Option<OwnerId>,
        events: impl IntoIterator<Item = &'a Event>,
        policy: VersionPolicy,
    ) -> Result<Self, PayloadError> {
        let mut stream = Self::new(name, id, S::default()).with_policy(policy);
        stream.owner = owner;
        for event in events {
            stream.state.apply(event)?;
            stream.version += 1;
            stream.updated_at = event.created_at();
        }
        Ok(stream)
    }

    /// Append a new event: stamp it, fold it into the state, record it as a change.
    ///
    /// The state is updated immediately. If `apply` fails part-way the state
    /// may already be modified, so callers must discard this instance on error.
    pub fn mutate<P: Serialize + ?Sized>(
        &mut self,
        event_name: impl Into<String>,
        payload: &P,
    ) -> Result<&Event, PayloadError> {
        let event_name = event_name.into();
        let payload = encode_payload(&event_name, payload)?;
        let version = self.policy.event_version(self.version() + 1);
        let event = Event::new(
            event_name,
            self.name.clone(),
            self.id,
            self.owner,
            version,
            payload,
        );

        self.state.apply(&event)?;
        self.updated_at = Utc::now();
        self.changes.push(event);
        Ok(&self.changes[self.changes.len() - 1])
    }

    /// Overwrite the identity of a blank stream (create-mode routing).
    pub fn assign(&mut self, id: StreamId, owner: Option<OwnerId>) {
        self.id = id;
        if owner.is_some() {
            self.owner = owner;
        }
    }
}

impl<S> Stream<S> {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn version(&self) -> u64 {
        self.version + self.changes.len() as u64
    }

    pub fn previous_version(&self) -> u64 {
        self.version
    }

    /// Version storage must still hold for these changes to be accepted.
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.version)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn policy(&self) -> VersionPolicy {
        self.policy
    }

    pub fn changes(&self) -> &[Event] {
        &self.changes
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Drop pending events once they have been delivered.
    ///
    /// The delivered events now count towards the persisted version.
    pub fn clear_changes(&mut self) {
        self.version += self.changes.len() as u64;
        self.changes.clear();
    }

    /// Snapshot of the stream at `version()`, borrowing the state.
    pub fn snapshot(&self) -> StreamSnapshot<&S> {
        StreamSnapshot {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner,
            version: self.version(),
            updated_at: self.updated_at,
            state: &self.state,
        }
    }
}
