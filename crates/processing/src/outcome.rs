use common::{AggregateId, CommandId};
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::error::ProcessingError;

/// How a successfully handled command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// A new stream was committed and published.
    Applied,
    /// The handler raised no events; nothing was stored.
    NoChanges,
    /// The command id was handled before; nothing was re-executed.
    Duplicate,
}

/// The successful result delivered to the submitter of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    pub status: CommandStatus,
    /// The committed version for `Applied`, the unchanged current version for
    /// `NoChanges`, and the originally committed version for `Duplicate`.
    pub version: Option<Version>,
}

impl CommandOutcome {
    pub fn applied(command_id: CommandId, aggregate_id: AggregateId, version: Version) -> Self {
        Self {
            command_id,
            aggregate_id,
            status: CommandStatus::Applied,
            version: Some(version),
        }
    }

    pub fn no_changes(command_id: CommandId, aggregate_id: AggregateId, version: Version) -> Self {
        Self {
            command_id,
            aggregate_id,
            status: CommandStatus::NoChanges,
            version: Some(version),
        }
    }

    pub fn duplicate(
        command_id: CommandId,
        aggregate_id: AggregateId,
        version: Option<Version>,
    ) -> Self {
        Self {
            command_id,
            aggregate_id,
            status: CommandStatus::Duplicate,
            version,
        }
    }
}

/// What every submission eventually resolves to.
pub type CommandResult = Result<CommandOutcome, ProcessingError>;
