//! Identifiers and context types shared by every crate in the workspace.

pub mod types;

pub use types::{AggregateId, CommandId, Items, ProcessId};
