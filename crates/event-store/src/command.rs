//! The handled-command idempotency ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, CommandId, EventId, Items, ProcessId, Result, Version};

/// Record of a command the pipeline has finished handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandledCommand {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub command_type: String,
    pub process_id: Option<ProcessId>,
    /// The event that caused a process manager to issue this command.
    pub source_event_id: Option<EventId>,
    /// Version committed by the command, `None` when it raised no events.
    pub version: Option<Version>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub items: Items,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of inserting into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAddResult {
    Success,
    /// A record with the same command id already exists.
    DuplicateCommand,
}

/// Durable ledger of handled command ids.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Inserts a record keyed by its command id.
    async fn insert(&self, command: &HandledCommand) -> Result<CommandAddResult>;

    /// Finds the record for a command id.
    async fn find(&self, command_id: &CommandId) -> Result<Option<HandledCommand>>;

    /// Removes a record. Returns false when no record existed.
    async fn remove(&self, command_id: &CommandId) -> Result<bool>;
}
