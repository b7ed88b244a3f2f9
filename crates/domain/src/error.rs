//! Domain error types.

use common::AggregateId;
use event_store::{StreamError, Version};
use thiserror::Error;

/// Errors raised by the aggregate runtime and the command model.
#[derive(Debug, Error)]
pub enum DomainError {
    /// No internal handler is registered for an event type.
    #[error("No handler for event {event_type} on aggregate {aggregate_type}")]
    EventHandlerNotFound {
        aggregate_type: &'static str,
        event_type: String,
    },

    /// No handler is registered for a command type.
    #[error("No handler for command {command_type} on aggregate {aggregate_type}")]
    CommandHandlerNotFound {
        aggregate_type: &'static str,
        command_type: String,
    },

    /// The aggregate id was already assigned.
    #[error("Aggregate id already assigned: {0}")]
    IdAlreadyAssigned(AggregateId),

    /// An id cannot be assigned to an aggregate that already has history.
    #[error("Cannot assign id {id} to an aggregate at version {version}")]
    IdAfterHistory { id: AggregateId, version: Version },

    /// Events were raised on an aggregate that has no id.
    #[error("Aggregate of type {0} has no id")]
    MissingId(&'static str),

    /// A replayed stream does not follow the aggregate's current version.
    #[error("Stream out of order for aggregate {aggregate_id}: expected version {expected}, found {found}")]
    StreamOutOfOrder {
        aggregate_id: AggregateId,
        expected: Version,
        found: Version,
    },

    /// A replayed stream belongs to another aggregate.
    #[error("Stream for aggregate {found} replayed into aggregate {expected}")]
    ForeignStream {
        expected: AggregateId,
        found: AggregateId,
    },

    /// Business logic refused the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// The produced events do not form a valid stream.
    #[error("Invalid event stream: {0}")]
    Stream(#[from] StreamError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
