use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AggregateId;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Aggregate version, used for optimistic concurrency control.
///
/// A fresh aggregate is at version 0. Every committed event stream advances
/// the aggregate by exactly one, so the first stream is version 1 no matter
/// how many events it carries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for an aggregate with no history.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version of the first committed stream.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns true when this is a version a stream can be stored at.
    pub fn is_committed(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A versioned domain event as persisted and published.
///
/// The version and timestamp are assigned once, when the envelope is
/// created, and there is no way to change them afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: String,
    aggregate_id: AggregateId,
    version: Version,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
}

impl EventEnvelope {
    /// Stamps a serialized event with its aggregate, version and the current time.
    pub fn new(
        aggregate_id: AggregateId,
        version: Version,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_id,
            version,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Unique identifier for this event.
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// The type of the event (e.g., "NoteCreated").
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The aggregate this event belongs to.
    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// The version of the stream this event was committed in.
    pub fn version(&self) -> Version {
        self.version
    }

    /// When the event was raised.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The event payload as JSON.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserializes the payload into a concrete event type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
