//! The event stream: the atomic unit of persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AggregateId, CommandId, EventEnvelope, Items, ProcessId, Version};

/// Reasons an event stream cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A stream must carry at least one event.
    #[error("Event stream for aggregate {0} has no events")]
    Empty(AggregateId),

    /// Streams are stored at positive versions only.
    #[error("Event stream for aggregate {aggregate_id} has invalid version {version}")]
    InvalidVersion {
        aggregate_id: AggregateId,
        version: Version,
    },

    /// An event belongs to a different aggregate than its stream.
    #[error("Event {event_type} belongs to aggregate {found}, stream is for {expected}")]
    AggregateMismatch {
        event_type: String,
        expected: AggregateId,
        found: AggregateId,
    },

    /// An event carries a different version than its stream.
    #[error("Event {event_type} has version {found}, stream is at version {expected}")]
    VersionMismatch {
        event_type: String,
        expected: Version,
        found: Version,
    },
}

/// An ordered, non-empty batch of events produced by one command and
/// persisted atomically at a single aggregate version.
///
/// Every event in the stream carries the stream's aggregate id and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStream {
    command_id: CommandId,
    aggregate_id: AggregateId,
    aggregate_type: String,
    process_id: Option<ProcessId>,
    version: Version,
    timestamp: DateTime<Utc>,
    events: Vec<EventEnvelope>,
    #[serde(default)]
    items: Items,
}

impl EventStream {
    /// Creates a stream, verifying that `events` is non-empty and that every
    /// event matches the stream's aggregate id and version.
    pub fn new(
        command_id: CommandId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        events: Vec<EventEnvelope>,
    ) -> Result<Self, StreamError> {
        verify_events(&aggregate_id, version, &events)?;

        Ok(Self {
            command_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            process_id: None,
            version,
            timestamp: Utc::now(),
            events,
            items: Items::new(),
        })
    }

    /// Sets the process-manager correlation id.
    pub fn with_process_id(mut self, process_id: Option<ProcessId>) -> Self {
        self.process_id = process_id;
        self
    }

    /// Sets the context items copied from the command.
    pub fn with_items(mut self, items: Items) -> Self {
        self.items = items;
        self
    }

    /// Overrides the stream timestamp, used when loading from storage.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Re-checks the stream invariants.
    ///
    /// Streams deserialized from storage or the wire bypass [`EventStream::new`].
    pub fn verify(&self) -> Result<(), StreamError> {
        verify_events(&self.aggregate_id, self.version, &self.events)
    }

    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn process_id(&self) -> Option<&ProcessId> {
        self.process_id.as_ref()
    }

    /// The version the aggregate reaches after applying this stream.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The events in the order they were raised.
    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn items(&self) -> &Items {
        &self.items
    }
}

fn verify_events(
    aggregate_id: &AggregateId,
    version: Version,
    events: &[EventEnvelope],
) -> Result<(), StreamError> {
    if events.is_empty() {
        return Err(StreamError::Empty(aggregate_id.clone()));
    }
    if !version.is_committed() {
        return Err(StreamError::InvalidVersion {
            aggregate_id: aggregate_id.clone(),
            version,
        });
    }

    for event in events {
        if event.aggregate_id() != aggregate_id {
            return Err(StreamError::AggregateMismatch {
                event_type: event.event_type().to_owned(),
                expected: aggregate_id.clone(),
                found: event.aggregate_id().clone(),
            });
        }
        if event.version() != version {
            return Err(StreamError::VersionMismatch {
                event_type: event.event_type().to_owned(),
                expected: version,
                found: event.version(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregate_id: &str, version: i64) -> EventEnvelope {
        EventEnvelope::new(
            AggregateId::from(aggregate_id),
            Version::new(version),
            "Deposited",
            serde_json::json!({"amount": 5}),
        )
    }

    #[test]
    fn builds_valid_stream() {
        let stream = EventStream::new(
            CommandId::from("cmd-1"),
            AggregateId::from("acct-1"),
            "Account",
            Version::new(2),
            vec![event("acct-1", 2), event("acct-1", 2)],
        )
        .unwrap()
        .with_process_id(Some(ProcessId::from("proc-1")));

        assert_eq!(stream.version(), Version::new(2));
        assert_eq!(stream.events().len(), 2);
        assert_eq!(stream.process_id().map(|p| p.as_str()), Some("proc-1"));
    }

    #[test]
    fn rejects_empty_stream() {
        let err = EventStream::new(
            CommandId::new(),
            AggregateId::from("acct-1"),
            "Account",
            Version::first(),
            vec![],
        )
        .unwrap_err();

        assert!(matches!(err, StreamError::Empty(_)));
    }

    #[test]
    fn rejects_foreign_aggregate_event() {
        let err = EventStream::new(
            CommandId::new(),
            AggregateId::from("acct-1"),
            "Account",
            Version::first(),
            vec![event("acct-1", 1), event("acct-2", 1)],
        )
        .unwrap_err();

        assert!(matches!(err, StreamError::AggregateMismatch { .. }));
    }

    #[test]
    fn rejects_version_mismatch() {
        let err = EventStream::new(
            CommandId::new(),
            AggregateId::from("acct-1"),
            "Account",
            Version::new(3),
            vec![event("acct-1", 2)],
        )
        .unwrap_err();

        assert_eq!(
            err,
            StreamError::VersionMismatch {
                event_type: "Deposited".to_string(),
                expected: Version::new(3),
                found: Version::new(2),
            }
        );
    }

    #[test]
    fn rejects_version_zero() {
        let err = EventStream::new(
            CommandId::new(),
            AggregateId::from("acct-1"),
            "Account",
            Version::initial(),
            vec![event("acct-1", 0)],
        )
        .unwrap_err();

        assert!(matches!(err, StreamError::InvalidVersion { .. }));
    }
}
