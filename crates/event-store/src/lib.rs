//! Persistence layer for the command-processing framework.
//!
//! Defines the durable collaborators the pipeline depends on:
//! - [`EventStore`]: versioned, append-only event streams
//! - [`CommandStore`]: the handled-command idempotency ledger
//! - [`SnapshotStore`]: optional aggregate snapshots
//! - [`PublishProgressStore`]: the last version delivered downstream
//!
//! In-memory implementations back the tests; [`PostgresStore`] implements
//! all four traits on a single connection pool.

pub mod command;
pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod progress;
pub mod snapshot;
pub mod store;
pub mod stream;

pub use command::{CommandAddResult, CommandStore, HandledCommand};
pub use common::{AggregateId, CommandId, Items, ProcessId};
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventId, Version};
pub use memory::{
    InMemoryCommandStore, InMemoryEventStore, InMemoryPublishProgressStore,
    InMemorySnapshotStore,
};
pub use postgres::PostgresStore;
pub use progress::PublishProgressStore;
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{AppendResult, EventStore};
pub use stream::{EventStream, StreamError};
