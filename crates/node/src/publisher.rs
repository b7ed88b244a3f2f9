//! Event transport that writes published streams to the log.

use async_trait::async_trait;
use processing::{EventMessage, EventPublisher, PublishError};

/// Logs every published stream instead of sending it to a broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, partition_key: &str, message: &[u8]) -> Result<(), PublishError> {
        let message =
            EventMessage::from_bytes(message).map_err(|e| PublishError(e.to_string()))?;
        let stream = &message.stream;
        let event_types: Vec<&str> = stream.events().iter().map(|e| e.event_type()).collect();

        tracing::info!(
            partition_key,
            message_id = %message.message_id,
            aggregate_type = stream.aggregate_type(),
            version = %stream.version(),
            command_id = %stream.command_id(),
            ?event_types,
            "event stream published"
        );
        Ok(())
    }
}
