//! Processing error types.

use std::sync::Arc;

use common::{AggregateId, CommandId};
use domain::DomainError;
use event_store::EventStoreError;
use thiserror::Error;

/// Terminal failures of a submitted command.
///
/// Conflicts and duplicates are not listed here: the pipeline resolves them
/// internally. The type is `Clone` because one result is delivered to every
/// caller waiting on the same command id.
#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    /// Every retry attempt hit an optimistic-concurrency conflict.
    #[error("Concurrency conflict on aggregate {aggregate_id} after {attempts} attempts")]
    ConcurrencyConflictExhausted {
        aggregate_id: AggregateId,
        attempts: u32,
    },

    /// The aggregate has no history and the command cannot create it.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// No handler is registered for the command, aggregate or event type.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// The per-aggregate queue is at capacity.
    #[error("Mailbox for aggregate {0} is full")]
    MailboxFull(AggregateId),

    /// The caller stopped waiting. The command may still complete.
    #[error("Command {0} timed out")]
    Timeout(CommandId),

    /// Business logic refused the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// The aggregate could not be put in a valid state (id or stream invariants).
    #[error("Invalid aggregate: {0}")]
    InvalidAggregate(String),

    /// A store failed.
    #[error("Storage error: {0}")]
    Storage(Arc<EventStoreError>),

    /// A command or event could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The service was dropped before the command finished.
    #[error("Command processing shut down")]
    ShutDown,
}

impl From<EventStoreError> for ProcessingError {
    fn from(err: EventStoreError) -> Self {
        ProcessingError::Storage(Arc::new(err))
    }
}

impl From<DomainError> for ProcessingError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::EventHandlerNotFound { .. } | DomainError::CommandHandlerNotFound { .. } => {
                ProcessingError::HandlerNotFound(err.to_string())
            }
            DomainError::Rejected(reason) => ProcessingError::Rejected(reason),
            DomainError::Serialization(e) => ProcessingError::Serialization(e.to_string()),
            DomainError::StreamOutOfOrder {
                aggregate_id,
                expected,
                found,
            } => EventStoreError::VersionGap {
                aggregate_id,
                expected,
                found,
            }
            .into(),
            other => ProcessingError::InvalidAggregate(other.to_string()),
        }
    }
}

/// Result type for processing operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

#[cfg(test)]
mod tests {
    use event_store::Version;

    use super::*;

    #[test]
    fn handler_errors_map_to_handler_not_found() {
        let err: ProcessingError = DomainError::CommandHandlerNotFound {
            aggregate_type: "Account",
            command_type: "Close".to_string(),
        }
        .into();
        assert!(matches!(err, ProcessingError::HandlerNotFound(msg) if msg.contains("Close")));
    }

    #[test]
    fn out_of_order_history_is_a_storage_error() {
        let err: ProcessingError = DomainError::StreamOutOfOrder {
            aggregate_id: AggregateId::from("acct-1"),
            expected: Version::new(2),
            found: Version::new(4),
        }
        .into();
        assert!(matches!(
            err,
            ProcessingError::Storage(inner) if matches!(*inner, EventStoreError::VersionGap { .. })
        ));
    }
}
