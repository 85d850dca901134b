use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidewater_core::{CommandId, OwnerId, PayloadError, StreamId};

use crate::event::{decode_payload, encode_payload};

/// A request to change one stream's state.
///
/// Commands represent **intent**. They are transient (never persisted) and are
/// turned into events by a controller, or rejected.
///
/// ## Command vs Event
///
/// - **Command**: Intent to do something (e.g., "place order")
/// - **Event**: Fact that something happened (e.g., "placed { total: 3 }")
///
/// ## Stream Targeting
///
/// `stream_name` selects the engine (one engine serves one stream type);
/// `stream_id` selects the instance. A command aimed at a stream that does not
/// exist yet may omit the id and let a create-mode controller allocate one.
/// `owner` scopes the stream when the storage is multi-tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: CommandId,
    name: String,
    stream_name: String,
    stream_id: Option<StreamId>,
    owner: Option<OwnerId>,
    created_at: DateTime<Utc>,
    payload: JsonValue,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        stream_name: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: CommandId::new(),
            name: name.into(),
            stream_name: stream_name.into(),
            stream_id: None,
            owner: None,
            created_at: Utc::now(),
            payload,
        }
    }

    /// Build a command from a typed payload.
    pub fn from_typed<T: Serialize>(
        name: impl Into<String>,
        stream_name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, PayloadError> {
        let name = name.into();
        let payload = encode_payload(&name, payload)?;
        Ok(Self::new(name, stream_name, payload))
    }

    pub fn with_stream_id(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        decode_payload(&self.name, &self.payload)
    }

    /// Successful reply carrying the resulting stream version.
    pub fn reply_ok(&self, version: u64) -> Reply {
        Reply::new(self.id, version, None)
    }

    /// Reply carrying a business error without failing the pipeline.
    pub fn reply_err(&self, error: impl Into<String>) -> Reply {
        Reply::new(self.id, 0, Some(error.into()))
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.stream_id {
            Some(id) => write!(
                f,
                "Command{{id: {}, name: {}, stream: {}/{}}}",
                self.id, self.name, self.stream_name, id
            ),
            None => write!(
                f,
                "Command{{id: {}, name: {}, stream: {}}}",
                self.id, self.name, self.stream_name
            ),
        }
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    command_id: CommandId,
    version: u64,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl Reply {
    pub fn new(command_id: CommandId, version: u64, error: Option<String>) -> Self {
        Self {
            command_id,
            version,
            error,
            created_at: Utc::now(),
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Stream version after the command (0 when the reply carries an error).
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
