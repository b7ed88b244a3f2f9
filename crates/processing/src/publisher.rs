//! Downstream event transport and the message published for each stream.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use event_store::{EventStream, Items};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A transport-level publish failure. Always retried.
#[derive(Debug, Clone, Error)]
#[error("Publish failed: {0}")]
pub struct PublishError(pub String);

/// Transport that delivers serialized messages downstream.
///
/// Messages sharing a partition key must be delivered in the order they
/// are published.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, partition_key: &str, message: &[u8]) -> Result<(), PublishError>;
}

/// The message published for one committed stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub message_id: Uuid,
    pub stream: EventStream,
    /// Context items carried by the command that produced the stream.
    #[serde(default)]
    pub items: Items,
}

impl EventMessage {
    pub fn new(stream: EventStream) -> Self {
        let items = stream.items().clone();
        Self {
            message_id: Uuid::new_v4(),
            stream,
            items,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Default)]
struct InMemoryPublisherState {
    messages: Vec<(String, Vec<u8>)>,
    attempts: usize,
    failures_left: usize,
}

/// In-memory transport for testing and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventPublisher {
    state: Arc<RwLock<InMemoryPublisherState>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publish calls fail.
    pub fn fail_next(&self, count: usize) {
        self.write().failures_left = count;
    }

    /// Successfully published messages, in delivery order.
    pub fn messages(&self) -> Vec<EventMessage> {
        self.read()
            .messages
            .iter()
            .filter_map(|(_, bytes)| EventMessage::from_bytes(bytes).ok())
            .collect()
    }

    /// Published messages for one partition key, in delivery order.
    pub fn messages_for(&self, partition_key: &str) -> Vec<EventMessage> {
        self.read()
            .messages
            .iter()
            .filter(|(key, _)| key == partition_key)
            .filter_map(|(_, bytes)| EventMessage::from_bytes(bytes).ok())
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.read().messages.len()
    }

    /// Publish calls made, failed ones included.
    pub fn attempts(&self) -> usize {
        self.read().attempts
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryPublisherState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryPublisherState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, partition_key: &str, message: &[u8]) -> Result<(), PublishError> {
        let mut state = self.write();
        state.attempts += 1;

        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(PublishError("transport unavailable".to_string()));
        }

        state
            .messages
            .push((partition_key.to_string(), message.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::{AggregateId, CommandId};
    use event_store::{EventEnvelope, Version};

    use super::*;

    fn stream(id: &str, version: i64) -> EventStream {
        let aggregate_id = AggregateId::from(id);
        let event = EventEnvelope::new(
            aggregate_id.clone(),
            Version::new(version),
            "Incremented",
            serde_json::json!({"by": 1}),
        );
        EventStream::new(
            CommandId::new(),
            aggregate_id,
            "Counter",
            Version::new(version),
            vec![event],
        )
        .unwrap()
        .with_items(Items::from([("tenant".to_string(), "acme".to_string())]))
    }

    #[test]
    fn message_carries_stream_and_items() {
        let message = EventMessage::new(stream("c-1", 1));
        assert_eq!(message.items.get("tenant").map(String::as_str), Some("acme"));

        let decoded = EventMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn failures_are_counted_then_cleared() {
        let publisher = InMemoryEventPublisher::new();
        publisher.fail_next(2);
        let bytes = EventMessage::new(stream("c-1", 1)).to_bytes().unwrap();

        assert!(publisher.publish("c-1", &bytes).await.is_err());
        assert!(publisher.publish("c-1", &bytes).await.is_err());
        assert!(publisher.publish("c-1", &bytes).await.is_ok());

        assert_eq!(publisher.attempts(), 3);
        assert_eq!(publisher.message_count(), 1);
    }

    #[tokio::test]
    async fn messages_are_grouped_by_partition_key() {
        let publisher = InMemoryEventPublisher::new();
        for (id, version) in [("c-1", 1), ("c-2", 1), ("c-1", 2)] {
            let bytes = EventMessage::new(stream(id, version)).to_bytes().unwrap();
            publisher.publish(id, &bytes).await.unwrap();
        }

        let versions: Vec<_> = publisher
            .messages_for("c-1")
            .iter()
            .map(|m| m.stream.version())
            .collect();
        assert_eq!(versions, vec![Version::new(1), Version::new(2)]);
        assert_eq!(publisher.messages().len(), 3);
    }
}
