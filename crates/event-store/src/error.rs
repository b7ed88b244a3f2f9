use thiserror::Error;

use crate::{AggregateId, Version};

/// Errors that can occur when interacting with a store.
///
/// Version collisions and duplicate commands are not errors: they are
/// reported through [`AppendResult`](crate::AppendResult) and
/// [`CommandAddResult`](crate::CommandAddResult).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Stored history for an aggregate is not contiguous.
    #[error("Version gap for aggregate {aggregate_id}: expected version {expected}, found {found}")]
    VersionGap {
        aggregate_id: AggregateId,
        expected: Version,
        found: Version,
    },

    /// A stream read back from storage violates the stream invariants.
    #[error("Corrupt stream: {0}")]
    CorruptStream(#[from] crate::StreamError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
