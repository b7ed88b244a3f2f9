use async_trait::async_trait;

use crate::{AggregateId, CommandId, EventStream, Result, Version};

/// Outcome of appending an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The stream was stored.
    Success,

    /// Another stream already occupies `(aggregate_id, version)`.
    ///
    /// This is the optimistic-concurrency conflict signal.
    DuplicateEventVersion,

    /// A stream produced by the same command was already stored for this
    /// aggregate.
    DuplicateCommand,
}

/// Durable, versioned history of aggregate event streams.
///
/// Implementations must make `append` atomic and must reject a second
/// stream at an already used `(aggregate_id, version)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a stream, guarded by its `(aggregate_id, version)` key.
    async fn append(&self, stream: &EventStream) -> Result<AppendResult>;

    /// Reads the streams of an aggregate with `from <= version <= to`,
    /// ordered by version. An open upper bound reads to the end.
    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from: Version,
        to: Option<Version>,
    ) -> Result<Vec<EventStream>>;

    /// Finds the stream a command produced for an aggregate, if any.
    async fn find_by_command(
        &self,
        aggregate_id: &AggregateId,
        command_id: &CommandId,
    ) -> Result<Option<EventStream>>;

    /// Returns the latest committed version of an aggregate.
    ///
    /// `Version::initial()` means the aggregate has no history.
    async fn current_version(&self, aggregate_id: &AggregateId) -> Result<Version>;
}
