use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidewater_core::{EventId, OwnerId, PayloadError, StreamId};

/// An immutable fact recorded against one stream.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (strictly increasing per stream)
/// - produced by `Stream::mutate`, then persisted and published as-is
///
/// The payload is carried as JSON. Consumers decode it into the shape they
/// expect with [`Event::decode`], which fails with a [`PayloadError`] instead of
/// panicking when the shape does not match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    name: String,

    stream_id: StreamId,
    stream_name: String,
    owner: Option<OwnerId>,

    /// Stream version at the moment the event was appended.
    version: u64,
    created_at: DateTime<Utc>,

    payload: JsonValue,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        stream_name: impl Into<String>,
        stream_id: StreamId,
        owner: Option<OwnerId>,
        version: u64,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            stream_id,
            stream_name: stream_name.into(),
            owner,
            version,
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload into the type the consumer expects.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        decode_payload(&self.name, &self.payload)
    }

    /// Routing key used by partitioned transports: same stream, same lane.
    pub fn routing_key(&self) -> String {
        format!("{}{}", self.stream_id, self.stream_name)
    }
}

impl core::fmt::Display for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Event{{id: {}, name: {}, version: {}, stream: {}/{}}}",
            self.id, self.name, self.version, self.stream_name, self.stream_id
        )
    }
}

pub(crate) fn encode_payload<T: Serialize + ?Sized>(
    name: &str,
    payload: &T,
) -> Result<JsonValue, PayloadError> {
    serde_json::to_value(payload).map_err(|e| PayloadError::Encode {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn decode_payload<T: DeserializeOwned>(
    name: &str,
    payload: &JsonValue,
) -> Result<T, PayloadError> {
    T::deserialize(payload).map_err(|e| PayloadError::Decode {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
